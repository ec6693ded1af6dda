//! Commit-based docker backend.
//!
//! Docker's engine API has no native notion of isolated stage builds with
//! cross-stage mounts, so this backend constructs stages by hand: create a
//! working container from the base image, copy files in, run the command
//! batch, then `docker commit` with `--change` entries for the config-only
//! instructions. `has_native_stage_support` is false; the conveyor rejects
//! mount-bearing RUN instructions before this backend is ever asked to build
//! them, and the backend enforces the same rule defensively on its own API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    expect_success, run_engine, with_retries, BackendSession, BuildStageOptions, ContainerBackend,
    ContainerCleaner, ImageInfo, RemoteOpts, StageBuildState,
};
use crate::error::{Result, StagecraftError};
use crate::instruction::{CommandArgs, Instruction};

const BACKEND_NAME: &str = "docker";
const REMOTE_ATTEMPTS: u32 = 3;

/// Backend driving a docker daemon through the `docker` CLI.
pub struct DockerDaemonBackend {
    binary: String,
    session: Arc<BackendSession>,
}

impl DockerDaemonBackend {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: &str) -> Self {
        Self { binary: binary.to_string(), session: Arc::new(BackendSession::new()) }
    }

    pub fn session(&self) -> Arc<BackendSession> {
        Arc::clone(&self.session)
    }

    async fn engine(&self, args: &[String], what: &str) -> Result<String> {
        let output = run_engine(&self.binary, args).await?;
        expect_success(BACKEND_NAME, what, output)
    }

    /// Creates the working container, runs the instruction batch inside it
    /// and commits the result. The caller owns container cleanup.
    async fn populate_and_commit(
        &self,
        container: &str,
        instructions: &[Instruction],
        opts: &BuildStageOptions,
        has_run_commands: bool,
    ) -> Result<String> {
        let mut state = StageBuildState::Created;
        debug!(container, ?state, "populating working container");
        for instruction in instructions {
            match instruction {
                Instruction::Copy { from: Some(reference), sources, destination, .. } => {
                    self.copy_from_dependency(container, reference, sources, destination, opts)
                        .await?;
                }
                Instruction::Copy { from: None, sources, destination, chown, chmod }
                | Instruction::Add { sources, destination, chown, chmod } => {
                    if chown.is_some() || chmod.is_some() {
                        warn!(
                            container,
                            "commit-based construction cannot apply chown/chmod, ignoring"
                        );
                    }
                    self.copy_from_context(container, sources, destination, opts).await?;
                }
                _ => {}
            }
        }

        if has_run_commands {
            state = StageBuildState::Running;
            debug!(container, ?state, "starting command batch");
            self.engine(
                &args(["container", "start", "--attach", container]),
                "command batch",
            )
            .await
            .map_err(|err| {
                state = StageBuildState::Failed;
                debug!(container, ?state, "command batch failed");
                StagecraftError::BuildCommandFailed {
                    container: container.to_string(),
                    details: err.to_string(),
                }
            })?;
        }

        let mut commit_args = args(["container", "commit"]);
        for change in commit_changes(instructions, &opts.labels) {
            commit_args.push("--change".to_string());
            commit_args.push(change);
        }
        commit_args.push(container.to_string());
        let image_id = self.engine(&commit_args, "commit").await?;
        state = StageBuildState::Committed;
        debug!(container, ?state, image = %image_id, "stage committed");
        Ok(image_id)
    }

    async fn copy_from_dependency(
        &self,
        container: &str,
        reference: &str,
        sources: &[String],
        destination: &str,
        opts: &BuildStageOptions,
    ) -> Result<()> {
        let dep_image = opts.dependency_images.get(reference).ok_or_else(|| {
            StagecraftError::Backend {
                backend: BACKEND_NAME.to_string(),
                reason: format!("no image bound for stage reference {reference:?}"),
            }
        })?;

        // docker cp cannot read from an image directly, so stage the files
        // through a throwaway container and a temp directory.
        let aux = format!("stagecraft-aux-{}", Uuid::new_v4().simple());
        self.engine(
            &args(["container", "create", "--name", &aux, dep_image, "true"]),
            "aux container create",
        )
        .await?;
        self.session.register(&aux);

        let staging = tempfile::tempdir().map_err(|e| StagecraftError::Io {
            path: std::env::temp_dir(),
            source: e,
        })?;
        let result = async {
            for source in sources {
                let local = staging.path().join(file_name(source));
                self.engine(
                    &args([
                        "container",
                        "cp",
                        &format!("{aux}:{source}"),
                        &local.display().to_string(),
                    ]),
                    "copy out of dependency",
                )
                .await?;
                self.engine(
                    &args([
                        "container",
                        "cp",
                        &local.display().to_string(),
                        &format!("{container}:{destination}"),
                    ]),
                    "copy into stage",
                )
                .await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = self.remove_container(&aux).await {
            warn!(container = %aux, %err, "failed to remove aux container");
        } else {
            self.session.deregister(&aux);
        }
        result
    }

    async fn copy_from_context(
        &self,
        container: &str,
        sources: &[String],
        destination: &str,
        opts: &BuildStageOptions,
    ) -> Result<()> {
        let context_dir = opts.context_dir.as_deref().ok_or_else(|| {
            StagecraftError::InvalidConfig {
                reason: "instruction reads the build context but no context directory was provided"
                    .to_string(),
            }
        })?;
        for source in sources {
            let host_path = context_dir.join(source);
            if !host_path.exists() {
                return Err(StagecraftError::ContextPathNotFound { path: host_path });
            }
            self.engine(
                &args([
                    "container",
                    "cp",
                    &host_path.display().to_string(),
                    &format!("{container}:{destination}"),
                ]),
                "copy from context",
            )
            .await?;
        }
        Ok(())
    }

    /// Drops the user into an interactive shell in the given image. Used by
    /// the introspection hooks; any failure here is logged and swallowed so
    /// introspection never masks the original build error.
    async fn introspect_image(&self, image: &str) {
        info!(image, "introspection shell, exit to continue");
        let status = tokio::process::Command::new(&self.binary)
            .args(["run", "-it", "--rm", image, "/bin/sh"])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await;
        if let Err(err) = status {
            warn!(image, %err, "introspection shell failed to start");
        }
    }

    async fn introspect_failed_container(&self, container: &str) {
        let snapshot = format!("stagecraft-introspect-{}", Uuid::new_v4().simple());
        match self
            .engine(&args(["container", "commit", container, &snapshot]), "introspect commit")
            .await
        {
            Ok(_) => {
                self.introspect_image(&snapshot).await;
                if let Err(err) =
                    self.engine(&args(["rmi", "--force", &snapshot]), "introspect cleanup").await
                {
                    warn!(image = %snapshot, %err, "failed to remove introspection image");
                }
            }
            Err(err) => warn!(container, %err, "failed to snapshot failed container"),
        }
    }
}

impl Default for DockerDaemonBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for DockerDaemonBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn has_native_stage_support(&self) -> bool {
        false
    }

    #[instrument(skip(self, instructions, opts), fields(backend = BACKEND_NAME))]
    async fn build_stage(
        &self,
        base: &str,
        instructions: &[Instruction],
        opts: &BuildStageOptions,
    ) -> Result<String> {
        for instruction in instructions {
            if let Instruction::Run { mounts, .. } = instruction {
                if !mounts.is_empty() {
                    return Err(StagecraftError::UnsupportedInstruction {
                        backend: BACKEND_NAME.to_string(),
                        kind: "RUN with cross-stage mounts".to_string(),
                    });
                }
            }
        }

        let run_lines: Vec<String> = instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Run { command, .. } => Some(command.shell_line()),
                _ => None,
            })
            .collect();

        let container = format!("stagecraft-{}", Uuid::new_v4().simple());
        let mut create_args = args(["container", "create", "--name", &container]);
        if let Some(platform) = &opts.target_platform {
            create_args.push("--platform".to_string());
            create_args.push(platform.clone());
        }
        create_args.push(base.to_string());
        if run_lines.is_empty() {
            create_args.push("true".to_string());
        } else {
            create_args.push("/bin/sh".to_string());
            create_args.push("-c".to_string());
            create_args.push(run_lines.join(" && "));
        }
        self.engine(&create_args, "container create").await?;
        self.session.register(&container);
        debug!(container, base, "working container created");

        let result = self
            .populate_and_commit(&container, instructions, opts, !run_lines.is_empty())
            .await;

        if result.is_err() {
            if opts.introspect_before_error {
                self.introspect_image(base).await;
            }
            if opts.introspect_after_error {
                self.introspect_failed_container(&container).await;
            }
        }

        match self.remove_container(&container).await {
            Ok(()) => self.session.deregister(&container),
            Err(err) => warn!(container, %err, "failed to remove working container"),
        }
        result
    }

    async fn tag(&self, reference: &str, new_reference: &str, _opts: &RemoteOpts) -> Result<()> {
        self.engine(&args(["tag", reference, new_reference]), "tag").await?;
        Ok(())
    }

    async fn push(&self, reference: &str, _opts: &RemoteOpts) -> Result<()> {
        with_retries("push", REMOTE_ATTEMPTS, || async {
            self.engine(&args(["push", reference]), "push").await?;
            Ok(())
        })
        .await
    }

    async fn pull(&self, reference: &str, opts: &RemoteOpts) -> Result<()> {
        with_retries("pull", REMOTE_ATTEMPTS, || async {
            let mut pull_args = args(["pull"]);
            if let Some(platform) = &opts.target_platform {
                pull_args.push("--platform".to_string());
                pull_args.push(platform.clone());
            }
            pull_args.push(reference.to_string());
            self.engine(&pull_args, "pull").await?;
            Ok(())
        })
        .await
    }

    async fn rmi(&self, reference: &str, opts: &RemoteOpts) -> Result<()> {
        let mut rmi_args = args(["rmi"]);
        if opts.force {
            rmi_args.push("--force".to_string());
        }
        rmi_args.push(reference.to_string());
        let output = run_engine(&self.binary, &rmi_args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!(reference, "image already absent");
            return Ok(());
        }
        expect_success(BACKEND_NAME, "rmi", output).map(|_| ())
    }

    async fn inspect(&self, reference: &str) -> Result<Option<ImageInfo>> {
        let output = run_engine(
            &self.binary,
            &args(["image", "inspect", "--format", "{{json .}}", reference]),
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            return expect_success(BACKEND_NAME, "inspect", output).map(|_| None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let record: DockerImageRecord =
            serde_json::from_str(stdout.trim()).map_err(|e| StagecraftError::Backend {
                backend: BACKEND_NAME.to_string(),
                reason: format!("malformed inspect output for {reference}: {e}"),
            })?;
        Ok(Some(record.into()))
    }
}

#[async_trait]
impl ContainerCleaner for DockerDaemonBackend {
    async fn remove_container(&self, name: &str) -> Result<()> {
        self.engine(&args(["container", "rm", "--force", name]), "container rm").await?;
        Ok(())
    }
}

fn args<const N: usize>(fixed: [&str; N]) -> Vec<String> {
    fixed.iter().map(|s| s.to_string()).collect()
}

fn file_name(source: &str) -> String {
    Path::new(source)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.trim_matches('/').to_string())
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("No such image") || stderr.contains("No such container")
}

fn render_command(command: &CommandArgs) -> String {
    match command {
        CommandArgs::Shell(line) => line.clone(),
        // serializing Vec<String> cannot fail
        CommandArgs::Exec(argv) => serde_json::to_string(argv).unwrap_or_default(),
    }
}

/// `--change` entries for commit, one per config-only instruction field.
/// Map-valued instructions are emitted in sorted key order so the committed
/// config is deterministic.
fn commit_changes(instructions: &[Instruction], labels: &[(String, String)]) -> Vec<String> {
    let mut changes = Vec::new();
    for instruction in instructions {
        match instruction {
            Instruction::Env { vars } => {
                let mut entries: Vec<_> = vars.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                for (key, value) in entries {
                    changes.push(format!("ENV {key}={value}"));
                }
            }
            Instruction::Cmd { command } => changes.push(format!("CMD {}", render_command(command))),
            Instruction::Entrypoint { command } => {
                changes.push(format!("ENTRYPOINT {}", render_command(command)));
            }
            Instruction::User { user } => changes.push(format!("USER {user}")),
            Instruction::Workdir { path } => changes.push(format!("WORKDIR {path}")),
            Instruction::Expose { ports } => {
                for port in ports {
                    changes.push(format!("EXPOSE {port}"));
                }
            }
            Instruction::Volume { paths } => {
                for path in paths {
                    changes.push(format!("VOLUME {path}"));
                }
            }
            Instruction::Label { labels } => {
                let mut entries: Vec<_> = labels.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                for (key, value) in entries {
                    changes.push(format!("LABEL {key}={value:?}"));
                }
            }
            Instruction::Onbuild { trigger } => changes.push(format!("ONBUILD {trigger}")),
            Instruction::Shell { shell } => {
                changes.push(format!("SHELL {}", serde_json::to_string(shell).unwrap_or_default()));
            }
            Instruction::Stopsignal { signal } => changes.push(format!("STOPSIGNAL {signal}")),
            Instruction::Healthcheck { spec } => {
                let mut line = String::from("HEALTHCHECK");
                if let Some(interval) = &spec.interval {
                    line.push_str(&format!(" --interval={interval}"));
                }
                if let Some(timeout) = &spec.timeout {
                    line.push_str(&format!(" --timeout={timeout}"));
                }
                if let Some(start) = &spec.start_period {
                    line.push_str(&format!(" --start-period={start}"));
                }
                if let Some(retries) = spec.retries {
                    line.push_str(&format!(" --retries={retries}"));
                }
                line.push_str(&format!(" CMD {}", spec.command.shell_line()));
                changes.push(line);
            }
            // docker commit has no MAINTAINER change; the label form carries it
            Instruction::Maintainer { name } => {
                changes.push(format!("LABEL maintainer={name:?}"));
            }
            _ => {}
        }
    }
    for (key, value) in labels {
        changes.push(format!("LABEL {key}={value:?}"));
    }
    changes
}

/// Subset of `docker image inspect` output the conveyor cares about.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerImageRecord {
    id: String,
    created: Option<String>,
    #[serde(default)]
    size: u64,
    parent: Option<String>,
    config: Option<DockerImageConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerImageConfig {
    labels: Option<HashMap<String, String>>,
}

impl From<DockerImageRecord> for ImageInfo {
    fn from(record: DockerImageRecord) -> Self {
        ImageInfo {
            id: record.id,
            created_at: record
                .created
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|c| c.with_timezone(&Utc)),
            size_bytes: record.size,
            labels: record.config.and_then(|c| c.labels).unwrap_or_default(),
            parent_id: record.parent.filter(|p| !p.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_changes_sorted_by_key() {
        let mut vars = HashMap::new();
        vars.insert("ZED".to_string(), "1".to_string());
        vars.insert("ALPHA".to_string(), "2".to_string());
        let changes = commit_changes(&[Instruction::Env { vars }], &[]);
        assert_eq!(changes, vec!["ENV ALPHA=2", "ENV ZED=1"]);
    }

    #[test]
    fn exec_form_renders_as_json_array() {
        let cmd = Instruction::Cmd {
            command: CommandArgs::Exec(vec!["nginx".into(), "-g".into(), "daemon off;".into()]),
        };
        let changes = commit_changes(&[cmd], &[]);
        assert_eq!(changes, vec![r#"CMD ["nginx","-g","daemon off;"]"#]);
    }

    #[test]
    fn extra_labels_appended_after_instructions() {
        let changes = commit_changes(
            &[Instruction::User { user: "app".into() }],
            &[("build.id".to_string(), "7".to_string())],
        );
        assert_eq!(changes, vec!["USER app", r#"LABEL build.id="7""#]);
    }

    #[test]
    fn healthcheck_flags_in_declaration_order() {
        let hc = Instruction::Healthcheck {
            spec: crate::instruction::HealthcheckSpec {
                command: CommandArgs::Shell("curl -f localhost".into()),
                interval: Some("30s".into()),
                timeout: None,
                start_period: None,
                retries: Some(3),
            },
        };
        let changes = commit_changes(&[hc], &[]);
        assert_eq!(changes, vec!["HEALTHCHECK --interval=30s --retries=3 CMD curl -f localhost"]);
    }

    #[test]
    fn not_found_detection_matches_daemon_phrasing() {
        assert!(is_not_found("Error: No such image: ghost:latest"));
        assert!(!is_not_found("Cannot connect to the Docker daemon"));
    }

    #[test]
    fn inspect_record_maps_into_image_info() {
        let raw = r#"{
            "Id": "sha256:abcd",
            "Created": "2026-01-02T03:04:05Z",
            "Size": 1024,
            "Parent": "",
            "Config": {"Labels": {"app": "web"}}
        }"#;
        let record: DockerImageRecord = serde_json::from_str(raw).unwrap();
        let info = ImageInfo::from(record);
        assert_eq!(info.id, "sha256:abcd");
        assert_eq!(info.size_bytes, 1024);
        assert_eq!(info.labels.get("app").map(String::as_str), Some("web"));
        assert!(info.parent_id.is_none());
        assert!(info.created_at.is_some());
    }

    #[test]
    fn file_name_falls_back_to_trimmed_source() {
        assert_eq!(file_name("app/bin/server"), "server");
        assert_eq!(file_name("/"), "");
    }
}
