//! Daemonless buildah backend.
//!
//! Buildah exposes the working-container primitives directly (`from`, `copy`,
//! `run`, `config`, `commit`), including `copy --from` for cross-stage reads
//! and mountable containers for `RUN --mount`, so this backend reports native
//! stage support and maps each instruction onto the matching subcommand.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    expect_success, run_engine, with_retries, BackendSession, BuildStageOptions, ContainerBackend,
    ContainerCleaner, ImageInfo, RemoteOpts,
};
use crate::error::{Result, StagecraftError};
use crate::instruction::{CommandArgs, Instruction, RunMount};

const BACKEND_NAME: &str = "buildah";
const REMOTE_ATTEMPTS: u32 = 3;

/// Backend driving rootless `buildah` directly, no daemon involved.
pub struct BuildahBackend {
    binary: String,
    session: Arc<BackendSession>,
}

impl BuildahBackend {
    pub fn new() -> Self {
        Self::with_binary("buildah")
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

    async fn apply(
        &self,
        container: &str,
        instruction: &Instruction,
        opts: &BuildStageOptions,
    ) -> Result<()> {
        match instruction {
            Instruction::Copy { from, sources, destination, chown, chmod } => {
                let mut copy_args = args(["copy"]);
                if let Some(reference) = from {
                    let dep_image = resolve_dependency(reference, opts)?;
                    copy_args.push("--from".to_string());
                    copy_args.push(dep_image.to_string());
                }
                push_ownership_flags(&mut copy_args, chown, chmod);
                copy_args.push(container.to_string());
                copy_args.extend(context_paths(from.is_none(), sources, opts)?);
                copy_args.push(destination.to_string());
                self.engine(&copy_args, "copy").await?;
            }
            Instruction::Add { sources, destination, chown, chmod } => {
                let mut add_args = args(["add"]);
                push_ownership_flags(&mut add_args, chown, chmod);
                add_args.push(container.to_string());
                add_args.extend(context_paths(true, sources, opts)?);
                add_args.push(destination.to_string());
                self.engine(&add_args, "add").await?;
            }
            Instruction::Run { command, mounts, network } => {
                self.run_command(container, command, mounts, network.as_deref(), opts).await?;
            }
            Instruction::From { .. } => {
                // base selection happens before the working container exists
            }
            config => {
                let mut config_args = args(["config"]);
                config_args.extend(config_flags(config));
                config_args.push(container.to_string());
                self.engine(&config_args, "config").await?;
            }
        }
        Ok(())
    }

    /// Runs one command batch. Cross-stage mounts are realized by mounting a
    /// throwaway container created from the dependency image and bind-mounting
    /// the requested path into the build container.
    async fn run_command(
        &self,
        container: &str,
        command: &CommandArgs,
        mounts: &[RunMount],
        network: Option<&str>,
        opts: &BuildStageOptions,
    ) -> Result<()> {
        let mut aux_containers = Vec::new();
        let mut run_args = args(["run"]);
        if let Some(network) = network {
            run_args.push("--network".to_string());
            run_args.push(network.to_string());
        }

        let result = async {
            for mount in mounts {
                let dep_image = resolve_dependency(&mount.from, opts)?;
                let aux = self.engine(&args(["from", dep_image]), "aux from").await?;
                self.session.register(&aux);
                aux_containers.push(aux.clone());
                let mountpoint = self.engine(&args(["mount", &aux]), "aux mount").await?;
                let source = format!("{mountpoint}{}", mount.source);
                run_args.push("--volume".to_string());
                run_args.push(format!("{source}:{}:ro", mount.target));
            }
            run_args.push(container.to_string());
            run_args.push("--".to_string());
            run_args.push("/bin/sh".to_string());
            run_args.push("-c".to_string());
            run_args.push(command.shell_line());
            self.engine(&run_args, "run").await.map_err(|err| {
                StagecraftError::BuildCommandFailed {
                    container: container.to_string(),
                    details: err.to_string(),
                }
            })?;
            Ok(())
        }
        .await;

        for aux in aux_containers {
            if let Err(err) = self.engine(&args(["umount", &aux]), "aux umount").await {
                warn!(container = %aux, %err, "failed to unmount aux container");
            }
            match self.remove_container(&aux).await {
                Ok(()) => self.session.deregister(&aux),
                Err(err) => warn!(container = %aux, %err, "failed to remove aux container"),
            }
        }
        result
    }

    async fn introspect_container(&self, container: &str) {
        info!(container, "introspection shell, exit to continue");
        let status = tokio::process::Command::new(&self.binary)
            .args(["run", "--terminal", container, "--", "/bin/sh"])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await;
        if let Err(err) = status {
            warn!(container, %err, "introspection shell failed to start");
        }
    }
}

impl Default for BuildahBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for BuildahBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn has_native_stage_support(&self) -> bool {
        true
    }

    #[instrument(skip(self, instructions, opts), fields(backend = BACKEND_NAME))]
    async fn build_stage(
        &self,
        base: &str,
        instructions: &[Instruction],
        opts: &BuildStageOptions,
    ) -> Result<String> {
        let mut from_args = args(["from", "--name"]);
        from_args.push(format!("stagecraft-{}", Uuid::new_v4().simple()));
        if let Some(platform) = &opts.target_platform {
            from_args.push("--platform".to_string());
            from_args.push(platform.clone());
        }
        from_args.push(base.to_string());
        let container = self.engine(&from_args, "from").await?;
        self.session.register(&container);
        debug!(container = %container, base, "working container created");

        let result = async {
            for instruction in instructions {
                self.apply(&container, instruction, opts).await?;
            }
            let mut commit_args = args(["commit"]);
            for (key, value) in &opts.labels {
                commit_args.push("--label".to_string());
                commit_args.push(format!("{key}={value}"));
            }
            commit_args.push(container.clone());
            self.engine(&commit_args, "commit").await
        }
        .await;

        if result.is_err() {
            if opts.introspect_before_error {
                // a fresh container from the base shows the pre-failure state
                if let Ok(probe) = self.engine(&args(["from", base]), "introspect from").await {
                    self.session.register(&probe);
                    self.introspect_container(&probe).await;
                    match self.remove_container(&probe).await {
                        Ok(()) => self.session.deregister(&probe),
                        Err(err) => warn!(container = %probe, %err, "failed to remove probe"),
                    }
                }
            }
            if opts.introspect_after_error {
                self.introspect_container(&container).await;
            }
        }

        match self.remove_container(&container).await {
            Ok(()) => self.session.deregister(&container),
            Err(err) => warn!(container = %container, %err, "failed to remove working container"),
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
            &args(["inspect", "--type", "image", reference]),
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
        let raw: Value = serde_json::from_str(stdout.trim()).map_err(|e| {
            StagecraftError::Backend {
                backend: BACKEND_NAME.to_string(),
                reason: format!("malformed inspect output for {reference}: {e}"),
            }
        })?;
        Ok(Some(parse_inspect(&raw)))
    }
}

#[async_trait]
impl ContainerCleaner for BuildahBackend {
    async fn remove_container(&self, name: &str) -> Result<()> {
        self.engine(&args(["rm", name]), "rm").await?;
        Ok(())
    }
}

fn args<const N: usize>(fixed: [&str; N]) -> Vec<String> {
    fixed.iter().map(|s| s.to_string()).collect()
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("image not known") || stderr.contains("container not known")
}

fn resolve_dependency<'a>(reference: &str, opts: &'a BuildStageOptions) -> Result<&'a str> {
    opts.dependency_images
        .get(reference)
        .map(String::as_str)
        .ok_or_else(|| StagecraftError::Backend {
            backend: BACKEND_NAME.to_string(),
            reason: format!("no image bound for stage reference {reference:?}"),
        })
}

/// Resolves context-relative sources against the context directory; `--from`
/// sources are container paths and pass through untouched.
fn context_paths(
    from_context: bool,
    sources: &[String],
    opts: &BuildStageOptions,
) -> Result<Vec<String>> {
    if !from_context {
        return Ok(sources.to_vec());
    }
    let context_dir = opts.context_dir.as_deref().ok_or_else(|| {
        StagecraftError::InvalidConfig {
            reason: "instruction reads the build context but no context directory was provided"
                .to_string(),
        }
    })?;
    let mut paths = Vec::with_capacity(sources.len());
    for source in sources {
        let host_path = context_dir.join(source);
        if !host_path.exists() {
            return Err(StagecraftError::ContextPathNotFound { path: host_path });
        }
        paths.push(host_path.display().to_string());
    }
    Ok(paths)
}

fn push_ownership_flags(
    copy_args: &mut Vec<String>,
    chown: &Option<String>,
    chmod: &Option<String>,
) {
    if let Some(chown) = chown {
        copy_args.push("--chown".to_string());
        copy_args.push(chown.clone());
    }
    if let Some(chmod) = chmod {
        copy_args.push("--chmod".to_string());
        copy_args.push(chmod.clone());
    }
}

/// `buildah config` flags for a config-only instruction. Map-valued
/// instructions are emitted in sorted key order.
fn config_flags(instruction: &Instruction) -> Vec<String> {
    let mut flags = Vec::new();
    let mut flag = |name: &str, value: String| {
        flags.push(format!("--{name}"));
        flags.push(value);
    };
    match instruction {
        Instruction::Env { vars } => {
            let mut entries: Vec<_> = vars.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, value) in entries {
                flag("env", format!("{key}={value}"));
            }
        }
        Instruction::Cmd { command } => flag("cmd", command.shell_line()),
        Instruction::Entrypoint { command } => flag("entrypoint", render_entrypoint(command)),
        Instruction::User { user } => flag("user", user.clone()),
        Instruction::Workdir { path } => flag("workingdir", path.clone()),
        Instruction::Expose { ports } => {
            for port in ports {
                flag("port", port.clone());
            }
        }
        Instruction::Volume { paths } => {
            for path in paths {
                flag("volume", path.clone());
            }
        }
        Instruction::Label { labels } => {
            let mut entries: Vec<_> = labels.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, value) in entries {
                flag("label", format!("{key}={value}"));
            }
        }
        Instruction::Onbuild { trigger } => flag("onbuild", trigger.clone()),
        Instruction::Shell { shell } => flag("shell", shell.join(" ")),
        Instruction::Stopsignal { signal } => flag("stop-signal", signal.clone()),
        Instruction::Healthcheck { spec } => {
            flag("healthcheck", format!("CMD {}", spec.command.shell_line()));
            if let Some(interval) = &spec.interval {
                flag("healthcheck-interval", interval.clone());
            }
            if let Some(timeout) = &spec.timeout {
                flag("healthcheck-timeout", timeout.clone());
            }
            if let Some(start) = &spec.start_period {
                flag("healthcheck-start-period", start.clone());
            }
            if let Some(retries) = spec.retries {
                flag("healthcheck-retries", retries.to_string());
            }
        }
        Instruction::Maintainer { name } => flag("author", name.clone()),
        _ => {}
    }
    flags
}

fn render_entrypoint(command: &CommandArgs) -> String {
    match command {
        CommandArgs::Shell(line) => line.clone(),
        CommandArgs::Exec(argv) => serde_json::to_string(argv).unwrap_or_default(),
    }
}

/// Pulls the fields the conveyor needs out of `buildah inspect` output, which
/// nests the OCI image config under a few possible keys depending on version.
fn parse_inspect(raw: &Value) -> ImageInfo {
    let id = raw
        .get("FromImageID")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let oci = raw.get("OCIv1");
    let created_at = oci
        .and_then(|o| o.get("created"))
        .and_then(Value::as_str)
        .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&chrono::Utc));
    let labels = oci
        .and_then(|o| o.get("config"))
        .and_then(|c| c.get("Labels"))
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    ImageInfo { id, created_at, size_bytes: 0, labels, parent_id: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_flags_for_env_sorted() {
        let mut vars = HashMap::new();
        vars.insert("B".to_string(), "2".to_string());
        vars.insert("A".to_string(), "1".to_string());
        let flags = config_flags(&Instruction::Env { vars });
        assert_eq!(flags, vec!["--env", "A=1", "--env", "B=2"]);
    }

    #[test]
    fn entrypoint_exec_form_is_json() {
        let flags = config_flags(&Instruction::Entrypoint {
            command: CommandArgs::Exec(vec!["/app/server".into(), "--port".into(), "80".into()]),
        });
        assert_eq!(flags, vec!["--entrypoint", r#"["/app/server","--port","80"]"#]);
    }

    #[test]
    fn non_config_instructions_yield_no_flags() {
        let run = Instruction::Run {
            command: CommandArgs::Shell("make".into()),
            mounts: Vec::new(),
            network: None,
        };
        assert!(config_flags(&run).is_empty());
    }

    #[test]
    fn not_found_detection_matches_buildah_phrasing() {
        assert!(is_not_found("error inspecting image: image not known"));
        assert!(!is_not_found("permission denied"));
    }

    #[test]
    fn inspect_parsing_reads_nested_oci_config() {
        let raw: Value = serde_json::from_str(
            r#"{
                "FromImageID": "abcd1234",
                "OCIv1": {
                    "created": "2026-03-04T05:06:07Z",
                    "config": {"Labels": {"tier": "web"}}
                }
            }"#,
        )
        .unwrap();
        let info = parse_inspect(&raw);
        assert_eq!(info.id, "abcd1234");
        assert!(info.created_at.is_some());
        assert_eq!(info.labels.get("tier").map(String::as_str), Some("web"));
    }

    #[test]
    fn dependency_resolution_requires_binding() {
        let mut opts = BuildStageOptions::default();
        assert!(resolve_dependency("builder", &opts).is_err());
        opts.dependency_images.insert("builder".to_string(), "img:1".to_string());
        assert_eq!(resolve_dependency("builder", &opts).unwrap(), "img:1");
    }
}
