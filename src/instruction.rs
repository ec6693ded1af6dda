//! Typed build instruction model.
//!
//! One closed sum type covers every build primitive the conveyor understands.
//! Instructions are immutable value objects: pure data plus a `name()` and the
//! ordered digest part list each kind contributes to its stage's cache key.
//! Parsing Dockerfile text into this representation is an external concern;
//! the conveyor only ever sees typed instructions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Shell or exec form of a RUN/CMD/ENTRYPOINT command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandArgs {
    /// Shell form: `RUN apt-get update`
    Shell(String),
    /// Exec form: `RUN ["apt-get", "update"]`
    Exec(Vec<String>),
}

impl CommandArgs {
    /// Canonical single-string rendering used for digests and shell execution.
    pub fn render(&self) -> String {
        match self {
            CommandArgs::Shell(s) => s.clone(),
            CommandArgs::Exec(args) => args.join("\u{1f}"),
        }
    }

    /// The command as a shell line an engine can pass to `sh -c`.
    pub fn shell_line(&self) -> String {
        match self {
            CommandArgs::Shell(s) => s.clone(),
            CommandArgs::Exec(args) => args.join(" "),
        }
    }
}

/// A `RUN --mount=from=...` mount referencing another stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMount {
    /// Stage alias or positional index the mount reads from.
    pub from: String,
    /// Source path inside the referenced stage.
    pub source: String,
    /// Target path inside the build container.
    pub target: String,
}

/// Structured HEALTHCHECK configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckSpec {
    pub command: CommandArgs,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<u32>,
}

/// Base of a FROM instruction: an external image or a prior stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromBase {
    /// External image reference (e.g. "alpine:3.19").
    Image(String),
    /// Alias or positional index of another stage.
    Stage(String),
}

/// A single typed build instruction.
///
/// `kind` is fixed by the variant and immutable after construction; two
/// instructions with identical variant and fields produce identical digest
/// part lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    From {
        base: FromBase,
        alias: Option<String>,
        platform: Option<String>,
    },
    Copy {
        /// Stage alias or index for `COPY --from=`.
        from: Option<String>,
        sources: Vec<String>,
        destination: String,
        chown: Option<String>,
        chmod: Option<String>,
    },
    Add {
        sources: Vec<String>,
        destination: String,
        chown: Option<String>,
        chmod: Option<String>,
    },
    Run {
        command: CommandArgs,
        mounts: Vec<RunMount>,
        network: Option<String>,
    },
    Env {
        vars: HashMap<String, String>,
    },
    Cmd {
        command: CommandArgs,
    },
    Entrypoint {
        command: CommandArgs,
    },
    User {
        user: String,
    },
    Workdir {
        path: String,
    },
    Expose {
        ports: Vec<String>,
    },
    Volume {
        paths: Vec<String>,
    },
    Label {
        labels: HashMap<String, String>,
    },
    Onbuild {
        trigger: String,
    },
    Shell {
        shell: Vec<String>,
    },
    Stopsignal {
        signal: String,
    },
    Healthcheck {
        spec: HealthcheckSpec,
    },
    Maintainer {
        name: String,
    },
}

impl Instruction {
    /// The instruction keyword.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Run { .. } => "RUN",
            Instruction::Env { .. } => "ENV",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::User { .. } => "USER",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Volume { .. } => "VOLUME",
            Instruction::Label { .. } => "LABEL",
            Instruction::Onbuild { .. } => "ONBUILD",
            Instruction::Shell { .. } => "SHELL",
            Instruction::Stopsignal { .. } => "STOPSIGNAL",
            Instruction::Healthcheck { .. } => "HEALTHCHECK",
            Instruction::Maintainer { .. } => "MAINTAINER",
        }
    }

    /// Ordered digest parts: the kind name first, then every field in a fixed
    /// documented order. Optional fields contribute an empty part when absent
    /// so every kind has a fixed arity. Map-valued fields (ENV, LABEL) are
    /// flattened in sorted key order; iteration order is never an input.
    pub fn digest_parts(&self) -> Vec<String> {
        let mut parts: Vec<String> = vec![self.name().to_string()];
        match self {
            Instruction::From { base, alias, platform } => {
                parts.push(match base {
                    FromBase::Image(image) => format!("image:{image}"),
                    FromBase::Stage(stage) => format!("stage:{stage}"),
                });
                parts.push(opt(alias));
                parts.push(opt(platform));
            }
            Instruction::Copy { from, sources, destination, chown, chmod } => {
                parts.push(opt(from));
                parts.push(join(sources));
                parts.push(destination.clone());
                parts.push(opt(chown));
                parts.push(opt(chmod));
            }
            Instruction::Add { sources, destination, chown, chmod } => {
                parts.push(join(sources));
                parts.push(destination.clone());
                parts.push(opt(chown));
                parts.push(opt(chmod));
            }
            Instruction::Run { command, mounts, network } => {
                parts.push(command.render());
                parts.push(join(
                    &mounts
                        .iter()
                        .map(|m| format!("from={} src={} dst={}", m.from, m.source, m.target))
                        .collect::<Vec<_>>(),
                ));
                parts.push(opt(network));
            }
            Instruction::Env { vars } => parts.push(join_map(vars)),
            Instruction::Cmd { command } => parts.push(command.render()),
            Instruction::Entrypoint { command } => parts.push(command.render()),
            Instruction::User { user } => parts.push(user.clone()),
            Instruction::Workdir { path } => parts.push(path.clone()),
            Instruction::Expose { ports } => parts.push(join(ports)),
            Instruction::Volume { paths } => parts.push(join(paths)),
            Instruction::Label { labels } => parts.push(join_map(labels)),
            Instruction::Onbuild { trigger } => parts.push(trigger.clone()),
            Instruction::Shell { shell } => parts.push(join(shell)),
            Instruction::Stopsignal { signal } => parts.push(signal.clone()),
            Instruction::Healthcheck { spec } => {
                parts.push(spec.command.render());
                parts.push(opt(&spec.interval));
                parts.push(opt(&spec.timeout));
                parts.push(opt(&spec.start_period));
                parts.push(spec.retries.map(|r| r.to_string()).unwrap_or_default());
            }
            Instruction::Maintainer { name } => parts.push(name.clone()),
        }
        parts
    }

    /// Build-context paths this instruction reads (COPY/ADD from the context).
    pub fn context_sources(&self) -> &[String] {
        match self {
            Instruction::Copy { from: None, sources, .. } => sources,
            Instruction::Add { sources, .. } => sources,
            _ => &[],
        }
    }

    /// Cross-stage references this instruction resolves against the graph
    /// (`COPY --from=` and `RUN --mount=from=`).
    pub fn stage_references(&self) -> Vec<&str> {
        match self {
            Instruction::Copy { from: Some(reference), .. } => vec![reference.as_str()],
            Instruction::Run { mounts, .. } => {
                mounts.iter().map(|m| m.from.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// True for instructions that only adjust image configuration and are
    /// applied at commit time rather than executed in the container.
    pub fn is_config_only(&self) -> bool {
        matches!(
            self,
            Instruction::Env { .. }
                | Instruction::Cmd { .. }
                | Instruction::Entrypoint { .. }
                | Instruction::User { .. }
                | Instruction::Workdir { .. }
                | Instruction::Expose { .. }
                | Instruction::Volume { .. }
                | Instruction::Label { .. }
                | Instruction::Onbuild { .. }
                | Instruction::Shell { .. }
                | Instruction::Stopsignal { .. }
                | Instruction::Healthcheck { .. }
                | Instruction::Maintainer { .. }
        )
    }
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn join(items: &[String]) -> String {
    items.join("\n")
}

fn join_map(map: &HashMap<String, String>) -> String {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn copy(chown: Option<&str>) -> Instruction {
        Instruction::Copy {
            from: None,
            sources: vec!["src".into()],
            destination: "/app".into(),
            chown: chown.map(String::from),
            chmod: None,
        }
    }

    #[test]
    fn identical_instructions_share_digest() {
        let a = Digest::compute(&copy(Some("1000:1000")).digest_parts());
        let b = Digest::compute(&copy(Some("1000:1000")).digest_parts());
        assert_eq!(a, b);
    }

    #[test]
    fn chown_change_is_digest_sensitive() {
        let a = Digest::compute(&copy(Some("1000:1000")).digest_parts());
        let b = Digest::compute(&copy(Some("1000:1001")).digest_parts());
        assert_ne!(a, b);
    }

    #[test]
    fn destination_change_is_digest_sensitive() {
        let a = copy(None);
        let b = Instruction::Copy {
            from: None,
            sources: vec!["src".into()],
            destination: "/app2".into(),
            chown: None,
            chmod: None,
        };
        assert_ne!(
            Digest::compute(&a.digest_parts()),
            Digest::compute(&b.digest_parts())
        );
    }

    #[test]
    fn env_digest_independent_of_insertion_order() {
        let mut forward = HashMap::new();
        forward.insert("A".to_string(), "1".to_string());
        forward.insert("B".to_string(), "2".to_string());
        forward.insert("C".to_string(), "3".to_string());

        let mut backward = HashMap::new();
        backward.insert("C".to_string(), "3".to_string());
        backward.insert("B".to_string(), "2".to_string());
        backward.insert("A".to_string(), "1".to_string());

        let a = Instruction::Env { vars: forward };
        let b = Instruction::Env { vars: backward };
        assert_eq!(a.digest_parts(), b.digest_parts());
        assert_eq!(
            Digest::compute(&a.digest_parts()),
            Digest::compute(&b.digest_parts())
        );
    }

    #[test]
    fn kind_name_leads_the_part_list() {
        let run = Instruction::Run {
            command: CommandArgs::Shell("make".into()),
            mounts: Vec::new(),
            network: None,
        };
        assert_eq!(run.digest_parts()[0], "RUN");
        assert_eq!(run.name(), "RUN");
    }

    #[test]
    fn exec_and_shell_forms_differ() {
        let shell = Instruction::Cmd { command: CommandArgs::Shell("nginx -g daemon".into()) };
        let exec = Instruction::Cmd {
            command: CommandArgs::Exec(vec!["nginx".into(), "-g".into(), "daemon".into()]),
        };
        assert_ne!(
            Digest::compute(&shell.digest_parts()),
            Digest::compute(&exec.digest_parts())
        );
    }

    #[test]
    fn context_sources_only_for_context_reads() {
        let local = copy(None);
        assert_eq!(local.context_sources(), ["src".to_string()]);

        let from_stage = Instruction::Copy {
            from: Some("builder".into()),
            sources: vec!["bin".into()],
            destination: "/usr/bin".into(),
            chown: None,
            chmod: None,
        };
        assert!(from_stage.context_sources().is_empty());
        assert_eq!(from_stage.stage_references(), vec!["builder"]);
    }

    #[test]
    fn run_mount_references_every_source_stage() {
        let run = Instruction::Run {
            command: CommandArgs::Shell("build.sh".into()),
            mounts: vec![
                RunMount { from: "deps".into(), source: "/cache".into(), target: "/cache".into() },
                RunMount { from: "0".into(), source: "/out".into(), target: "/out".into() },
            ],
            network: None,
        };
        assert_eq!(run.stage_references(), vec!["deps", "0"]);
    }
}
