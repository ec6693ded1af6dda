//! Stagecraft
//!
//! Content-addressed, multi-backend stage build pipeline: typed build
//! instructions become a stage DAG, every stage gets a content digest, and
//! digests key a shared image cache so identical stages are built exactly
//! once across hosts and concurrent builders.

pub mod backend;
pub mod config;
pub mod context;
pub mod conveyor;
pub mod digest;
pub mod error;
pub mod graph;
pub mod instruction;
pub mod paths;
pub mod storage;

// Re-export commonly used items
pub use backend::{
    BackendSession, BuildStageOptions, BuildahBackend, ContainerBackend, DockerDaemonBackend,
    ImageInfo, RemoteOpts,
};
pub use config::Config;
pub use context::{BuildContextArchiver, ChecksumOptions, ContextArchive};
pub use conveyor::{BuildReport, Conveyor, ConveyorOptions, StageOutcome};
pub use digest::Digest;
pub use error::{Result, StagecraftError};
pub use graph::{Stage, StageGraph};
pub use instruction::{CommandArgs, FromBase, HealthcheckSpec, Instruction, RunMount};
pub use storage::{
    select_suitable, with_lock, FileLockManager, LocalStageStorage, LockManager,
    MemoryStageStorage, ProcessLockManager, StageRecord, StageStorage,
};
