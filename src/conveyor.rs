//! Stage conveyor: digest, cache lookup, locked build, persist.
//!
//! The conveyor walks the stage graph in dependency order and pushes every
//! stage through the same pipeline: assemble its content digest from the
//! instruction, its ancestry and the context checksum; look the digest up in
//! shared storage; on a miss, build under a named lock with a second lookup
//! inside the critical section so concurrent builders converge on one image.
//! Independent branches build in parallel on a bounded task set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BuildStageOptions, ContainerBackend, RemoteOpts};
use crate::context::{BuildContextArchiver, ChecksumOptions};
use crate::digest::Digest;
use crate::error::{Result, StagecraftError};
use crate::graph::{Stage, StageGraph};
use crate::instruction::Instruction;
use crate::storage::{
    generate_unique_id, select_suitable, with_lock, LockManager, StageRecord, StageStorage,
};

/// Run-level options for one conveyor pass.
#[derive(Debug, Clone)]
pub struct ConveyorOptions {
    pub target_platform: Option<String>,
    /// Upper bound on concurrently building stages.
    pub parallelism: usize,
    pub checksum: ChecksumOptions,
    pub introspect_before_error: bool,
    pub introspect_after_error: bool,
}

impl Default for ConveyorOptions {
    fn default() -> Self {
        Self {
            target_platform: None,
            parallelism: 4,
            checksum: ChecksumOptions::default(),
            introspect_before_error: false,
            introspect_after_error: false,
        }
    }
}

/// Result of processing one stage.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub id: usize,
    pub name: String,
    pub digest: Digest,
    pub image_ref: String,
    /// False when the stage was served from the shared cache.
    pub fresh_build: bool,
}

/// Summary of one conveyor run.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Reference of the target stage image (the final tag when one was
    /// requested).
    pub image_ref: String,
    /// Outcomes for every processed stage, in topological order.
    pub stages: Vec<StageOutcome>,
}

impl BuildReport {
    pub fn fresh_count(&self) -> usize {
        self.stages.iter().filter(|s| s.fresh_build).count()
    }
}

/// Drives stage graphs to committed images.
///
/// Cheap to clone; every run clones the conveyor into its worker tasks.
#[derive(Clone)]
pub struct Conveyor {
    project: String,
    storage: Arc<dyn StageStorage>,
    locks: Arc<dyn LockManager>,
    backend: Arc<dyn ContainerBackend>,
    archiver: Option<BuildContextArchiver>,
    options: ConveyorOptions,
}

impl Conveyor {
    pub fn new(
        project: &str,
        storage: Arc<dyn StageStorage>,
        locks: Arc<dyn LockManager>,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Self {
            project: project.to_string(),
            storage,
            locks,
            backend,
            archiver: None,
            options: ConveyorOptions::default(),
        }
    }

    /// Attaches a build context. Required when the graph contains
    /// instructions that read context files.
    pub fn with_context(mut self, archiver: BuildContextArchiver) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn with_options(mut self, options: ConveyorOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the target stage and everything it depends on, optionally
    /// tagging the result. Within one run every dependent of a stage observes
    /// the same image reference for it.
    #[instrument(skip(self, graph), fields(project = %self.project))]
    pub async fn run(
        &self,
        graph: &StageGraph,
        target: &str,
        final_tag: Option<&str>,
    ) -> Result<BuildReport> {
        let target_stage = graph.target_stage(target)?;
        let target_id = target_stage.id;
        let needed = graph.ancestors_inclusive(target_id);
        info!(
            target = %target_stage.name,
            stages = needed.len(),
            storage = %self.storage.address(),
            backend = self.backend.name(),
            "conveyor run started"
        );

        let mut results: HashMap<usize, StageOutcome> = HashMap::new();
        let mut running: HashSet<usize> = HashSet::new();
        let mut tasks: JoinSet<(usize, Result<StageOutcome>)> = JoinSet::new();
        let parallelism = self.options.parallelism.max(1);

        loop {
            for &id in &needed {
                if running.len() >= parallelism {
                    break;
                }
                if results.contains_key(&id) || running.contains(&id) {
                    continue;
                }
                // invariant: ids in `needed` are valid graph indices
                let stage = graph
                    .get(id)
                    .ok_or_else(|| StagecraftError::Internal(format!("missing stage {id}")))?
                    .clone();
                let upstream_ready = stage
                    .base
                    .iter()
                    .chain(stage.dependencies.iter())
                    .all(|dep| results.contains_key(dep));
                if !upstream_ready {
                    continue;
                }
                let base = stage.base.map(|b| results[&b].clone());
                let deps: Vec<StageOutcome> =
                    stage.dependencies.iter().map(|d| results[d].clone()).collect();
                let conveyor = self.clone();
                running.insert(id);
                tasks.spawn(async move {
                    let outcome = conveyor.process_stage(&stage, base, &deps).await;
                    (id, outcome)
                });
            }

            match tasks.join_next().await {
                Some(Ok((id, Ok(outcome)))) => {
                    running.remove(&id);
                    results.insert(id, outcome);
                }
                Some(Ok((_, Err(err)))) => return Err(err),
                Some(Err(join_err)) => {
                    return Err(StagecraftError::Internal(format!(
                        "stage task panicked: {join_err}"
                    )))
                }
                None => break,
            }
        }

        let target_outcome = results.remove(&target_id).ok_or_else(|| {
            StagecraftError::Internal("conveyor finished without a target outcome".to_string())
        })?;
        results.insert(target_id, target_outcome.clone());

        let image_ref = match final_tag {
            Some(tag) => {
                self.backend
                    .tag(&target_outcome.image_ref, tag, &RemoteOpts::default())
                    .await?;
                info!(tag, "final image tagged");
                tag.to_string()
            }
            None => target_outcome.image_ref.clone(),
        };

        let mut stages: Vec<StageOutcome> = results.into_values().collect();
        stages.sort_by_key(|s| s.id);
        info!(
            image = %image_ref,
            fresh = stages.iter().filter(|s| s.fresh_build).count(),
            cached = stages.iter().filter(|s| !s.fresh_build).count(),
            "conveyor run finished"
        );
        Ok(BuildReport { image_ref, stages })
    }

    /// Pushes one stage through digest, lookup, locked build and persist.
    async fn process_stage(
        &self,
        stage: &Stage,
        base: Option<StageOutcome>,
        deps: &[StageOutcome],
    ) -> Result<StageOutcome> {
        self.process_stage_inner(stage, base, deps)
            .await
            .map_err(|err| err.for_stage(&stage.name, stage.kind()))
    }

    async fn process_stage_inner(
        &self,
        stage: &Stage,
        base: Option<StageOutcome>,
        deps: &[StageOutcome],
    ) -> Result<StageOutcome> {
        let digest = self.stage_digest(stage, base.as_ref(), deps)?;
        let parent = base.as_ref().map(|b| b.digest.clone());
        debug!(stage = %stage.name, digest = %digest.short(), "stage digest assembled");

        // first lookup outside the lock; the common warm-cache path takes no
        // lock at all
        let records = self.storage.find_by_digest(&digest).await?;
        if let Some(record) = select_suitable(&records, parent.as_ref()) {
            info!(stage = %stage.name, image = %record.image_ref, "stage cache hit");
            return Ok(self.outcome(stage, digest, record.image_ref.clone(), false));
        }

        self.check_backend_support(stage)?;

        let key = format!("stage/{}/{}@{}", self.project, stage.name, digest);
        let base_ref = base.as_ref().map(|b| b.image_ref.clone());
        let (record, fresh) = with_lock(self.locks.as_ref(), &key, || async {
            // second lookup under the lock: another builder may have
            // finished while we waited
            let records = self.storage.find_by_digest(&digest).await?;
            if let Some(record) = select_suitable(&records, parent.as_ref()) {
                info!(stage = %stage.name, image = %record.image_ref, "stage built elsewhere");
                return Ok((record.clone(), false));
            }

            let built = self.materialize(stage, base_ref.as_deref(), deps).await?;
            let unique_id = generate_unique_id(&records);
            let image_ref = self.storage.construct_stage_ref(&self.project, &digest, unique_id);
            self.backend.tag(&built, &image_ref, &RemoteOpts::default()).await?;

            // persisted only after the image exists under its final reference
            let record = StageRecord {
                digest: digest.clone(),
                unique_id,
                created_at: chrono::Utc::now(),
                image_ref,
                parent_digest: parent.clone(),
            };
            self.storage.save(record.clone()).await?;
            info!(stage = %stage.name, image = %record.image_ref, "stage built and persisted");
            Ok((record, true))
        })
        .await?;

        Ok(self.outcome(stage, digest, record.image_ref, fresh))
    }

    fn outcome(
        &self,
        stage: &Stage,
        digest: Digest,
        image_ref: String,
        fresh_build: bool,
    ) -> StageOutcome {
        StageOutcome { id: stage.id, name: stage.name.clone(), digest, image_ref, fresh_build }
    }

    /// Assembles the stage digest: instruction parts (or the pass-through
    /// marker), the external base reference, the base stage digest, every
    /// dependency digest in declaration order, and the context checksum when
    /// the instruction reads context files. Order is fixed; each part is
    /// length-delimited by the digest engine.
    fn stage_digest(
        &self,
        stage: &Stage,
        base: Option<&StageOutcome>,
        deps: &[StageOutcome],
    ) -> Result<Digest> {
        let mut parts: Vec<String> = match &stage.instruction {
            Some(instruction) => instruction.digest_parts(),
            None => vec!["BASE".to_string()],
        };
        parts.push(stage.external_base.clone().unwrap_or_default());
        parts.push(base.map(|b| b.digest.to_string()).unwrap_or_default());
        for dep in deps {
            parts.push(dep.digest.to_string());
        }

        if let Some(instruction) = &stage.instruction {
            let sources = instruction.context_sources();
            if !sources.is_empty() {
                let archiver = self.archiver.as_ref().ok_or_else(|| {
                    StagecraftError::InvalidConfig {
                        reason: format!(
                            "stage {} reads the build context but no context directory is \
                             configured",
                            stage.name
                        ),
                    }
                })?;
                parts.push(archiver.checksum(sources, &self.options.checksum)?.to_string());
            }
        }

        Ok(Digest::compute(&parts))
    }

    /// Fails fast when the backend cannot execute this stage's instruction
    /// class, before any lock or container work.
    fn check_backend_support(&self, stage: &Stage) -> Result<()> {
        if self.backend.has_native_stage_support() {
            return Ok(());
        }
        if let Some(Instruction::Run { mounts, .. }) = &stage.instruction {
            if !mounts.is_empty() {
                return Err(StagecraftError::UnsupportedInstruction {
                    backend: self.backend.name().to_string(),
                    kind: "RUN with cross-stage mounts".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Produces the committed image for one stage and returns a reference the
    /// caller can tag. Pass-through and FROM stages only ensure the base
    /// image is present; every other stage runs a backend build.
    async fn materialize(
        &self,
        stage: &Stage,
        base_ref: Option<&str>,
        deps: &[StageOutcome],
    ) -> Result<String> {
        match &stage.instruction {
            None => {
                // synthetic base stage rooted at an external reference
                let reference = stage.external_base.as_deref().ok_or_else(|| {
                    StagecraftError::Internal(format!("stage {} has no base", stage.name))
                })?;
                self.ensure_image(reference).await?;
                Ok(reference.to_string())
            }
            Some(Instruction::From { platform, .. }) => {
                match &stage.external_base {
                    Some(reference) => {
                        self.ensure_image_for_platform(reference, platform.as_deref()).await?;
                        Ok(reference.to_string())
                    }
                    // FROM <stage>: alias of the referenced stage's image
                    None => base_ref.map(str::to_string).ok_or_else(|| {
                        StagecraftError::Internal(format!(
                            "stage {} resolved no base image",
                            stage.name
                        ))
                    }),
                }
            }
            Some(instruction) => {
                let base_image = base_ref.ok_or_else(|| {
                    StagecraftError::Internal(format!("stage {} has no base image", stage.name))
                })?;
                let opts = self.build_options(instruction, deps);
                self.backend
                    .build_stage(base_image, std::slice::from_ref(instruction), &opts)
                    .await
            }
        }
    }

    fn build_options(&self, instruction: &Instruction, deps: &[StageOutcome]) -> BuildStageOptions {
        // dependency order in the stage mirrors the instruction's reference
        // order, so zip rebinds each reference string to its built image
        let dependency_images: HashMap<String, String> = instruction
            .stage_references()
            .into_iter()
            .zip(deps)
            .map(|(reference, dep)| (reference.to_string(), dep.image_ref.clone()))
            .collect();
        BuildStageOptions {
            target_platform: self.options.target_platform.clone(),
            context_dir: self.archiver.as_ref().map(|a| a.root().to_path_buf()),
            dependency_images,
            labels: vec![("stagecraft.project".to_string(), self.project.clone())],
            introspect_before_error: self.options.introspect_before_error,
            introspect_after_error: self.options.introspect_after_error,
        }
    }

    async fn ensure_image(&self, reference: &str) -> Result<()> {
        self.ensure_image_for_platform(reference, None).await
    }

    async fn ensure_image_for_platform(
        &self,
        reference: &str,
        platform: Option<&str>,
    ) -> Result<()> {
        if self.backend.inspect(reference).await?.is_some() {
            return Ok(());
        }
        info!(reference, "base image absent, pulling");
        let opts = RemoteOpts {
            target_platform: platform
                .map(str::to_string)
                .or_else(|| self.options.target_platform.clone()),
            force: false,
        };
        self.backend.pull(reference, &opts).await?;
        if self.backend.inspect(reference).await?.is_none() {
            warn!(reference, "image still absent after pull");
            return Err(StagecraftError::ImageNotFound { reference: reference.to_string() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_bound_parallelism() {
        let options = ConveyorOptions::default();
        assert!(options.parallelism >= 1);
        assert!(!options.checksum.include_mode_bits);
    }

    #[test]
    fn report_counts_fresh_stages() {
        let report = BuildReport {
            image_ref: "app:latest".to_string(),
            stages: vec![
                StageOutcome {
                    id: 0,
                    name: "base".to_string(),
                    digest: Digest::compute(&["a"]),
                    image_ref: "p:a-1".to_string(),
                    fresh_build: false,
                },
                StageOutcome {
                    id: 1,
                    name: "RUN#1".to_string(),
                    digest: Digest::compute(&["b"]),
                    image_ref: "p:b-2".to_string(),
                    fresh_build: true,
                },
            ],
        };
        assert_eq!(report.fresh_count(), 1);
    }
}
