//! Stage dependency graph.
//!
//! Turns a typed instruction stream into a DAG of stages, one stage per
//! instruction. `FROM` opens a new Dockerfile-level stage; every other
//! instruction's base is the preceding stage of its Dockerfile-level stage.
//! Cross-stage references (`COPY --from`, `RUN --mount=from=`) resolve by
//! declared alias or positional index against the stages seen so far, so
//! dependency edges can only point backwards and the graph is acyclic by
//! construction. An unresolved reference is a fatal configuration error
//! detected before any digest or backend work.

use crate::error::{Result, StagecraftError};
use crate::instruction::{FromBase, Instruction};
use std::collections::HashMap;

/// One node of the build DAG: a single cacheable unit of image construction.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Position in the graph; ids ascend in topological order.
    pub id: usize,
    /// Instruction kind + ordinal, or the user-declared alias for FROM stages.
    pub name: String,
    /// The upstream stage this stage builds on, if any.
    pub base: Option<usize>,
    /// External image reference for stages rooted outside the graph.
    pub external_base: Option<String>,
    /// The instruction realized by this stage; `None` for the synthetic
    /// pass-through base stage created from an explicit base reference.
    pub instruction: Option<Instruction>,
    /// Stages this stage's instruction reads from (copy-from, mount-from).
    pub dependencies: Vec<usize>,
}

impl Stage {
    /// The instruction keyword, or "BASE" for the pass-through stage.
    pub fn kind(&self) -> &'static str {
        self.instruction.as_ref().map(Instruction::name).unwrap_or("BASE")
    }
}

/// One Dockerfile-level stage: a FROM (or the synthetic base) plus the run of
/// instructions that follow it.
#[derive(Debug, Clone)]
struct StageRun {
    alias: Option<String>,
    last: usize,
}

/// The complete, validated build DAG for one image.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<Stage>,
    runs: Vec<StageRun>,
    aliases: HashMap<String, usize>,
}

impl StageGraph {
    /// Builds the graph from an instruction stream.
    ///
    /// `base_ref` roots the graph when the stream does not open with FROM
    /// (the native config case); it is ignored otherwise.
    pub fn build(instructions: Vec<Instruction>, base_ref: &str) -> Result<Self> {
        let mut builder = GraphBuilder::default();

        for instruction in instructions {
            match instruction {
                Instruction::From { .. } => builder.open_stage_run(instruction)?,
                other => builder.append(other, base_ref)?,
            }
        }

        if builder.stages.is_empty() {
            return Err(StagecraftError::InvalidConfig {
                reason: "instruction stream is empty".to_string(),
            });
        }

        Ok(StageGraph { stages: builder.stages, runs: builder.runs, aliases: builder.aliases })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn get(&self, id: usize) -> Option<&Stage> {
        self.stages.get(id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Resolves a build target: the last stage for `""`, or the final stage
    /// of the aliased Dockerfile-level stage.
    pub fn target_stage(&self, name: &str) -> Result<&Stage> {
        if name.is_empty() {
            return self
                .stages
                .last()
                .ok_or_else(|| StagecraftError::InvalidTarget { name: name.to_string() });
        }
        let run = self
            .aliases
            .get(name)
            .ok_or_else(|| StagecraftError::InvalidTarget { name: name.to_string() })?;
        Ok(&self.stages[self.runs[*run].last])
    }

    /// Every stage the given stage transitively builds on or reads from,
    /// including itself, in topological (ascending id) order.
    pub fn ancestors_inclusive(&self, id: usize) -> Vec<usize> {
        let mut needed = vec![false; self.stages.len()];
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if needed[current] {
                continue;
            }
            needed[current] = true;
            let stage = &self.stages[current];
            if let Some(base) = stage.base {
                pending.push(base);
            }
            pending.extend(stage.dependencies.iter().copied());
        }
        (0..self.stages.len()).filter(|i| needed[*i]).collect()
    }
}

#[derive(Default)]
struct GraphBuilder {
    stages: Vec<Stage>,
    runs: Vec<StageRun>,
    aliases: HashMap<String, usize>,
}

impl GraphBuilder {
    fn open_stage_run(&mut self, instruction: Instruction) -> Result<()> {
        let (base, alias) = match &instruction {
            Instruction::From { base, alias, .. } => (base.clone(), alias.clone()),
            _ => unreachable!("open_stage_run is only called for FROM"),
        };

        let id = self.stages.len();
        let name = alias.clone().unwrap_or_else(|| format!("FROM{id}"));

        let (base_stage, external_base) = match base {
            FromBase::Image(image) => (None, Some(image)),
            FromBase::Stage(reference) => {
                // the new run is not pushed yet, so every existing run is an
                // earlier one and a valid target
                let stage_name = name.clone();
                (Some(self.resolve(&reference, &stage_name, self.runs.len())?), None)
            }
        };

        if let Some(alias) = &alias {
            if self.aliases.contains_key(alias) {
                return Err(StagecraftError::InvalidConfig {
                    reason: format!("duplicate stage alias {alias:?}"),
                });
            }
            self.aliases.insert(alias.clone(), self.runs.len());
        }

        self.runs.push(StageRun { alias, last: id });
        self.stages.push(Stage {
            id,
            name,
            base: base_stage,
            external_base,
            instruction: Some(instruction),
            dependencies: Vec::new(),
        });
        Ok(())
    }

    fn append(&mut self, instruction: Instruction, base_ref: &str) -> Result<()> {
        if self.runs.is_empty() {
            self.synthesize_base(base_ref)?;
        }

        let id = self.stages.len();
        let name = format!("{}{}", instruction.name(), id);

        // the current run is not a valid reference target for its own
        // instructions, only runs opened before it are
        let resolvable_runs = self.runs.len() - 1;
        let mut dependencies = Vec::new();
        for reference in instruction.stage_references() {
            dependencies.push(self.resolve(reference, &name, resolvable_runs)?);
        }

        let run = self.runs.len() - 1;
        let base = Some(self.runs[run].last);
        self.runs[run].last = id;

        self.stages.push(Stage {
            id,
            name,
            base,
            external_base: None,
            instruction: Some(instruction),
            dependencies,
        });
        Ok(())
    }

    /// Roots an instruction stream that has no leading FROM on the explicit
    /// base reference.
    fn synthesize_base(&mut self, base_ref: &str) -> Result<()> {
        if base_ref.is_empty() {
            return Err(StagecraftError::InvalidConfig {
                reason: "instruction stream does not start with FROM and no base reference given"
                    .to_string(),
            });
        }
        let id = self.stages.len();
        self.runs.push(StageRun { alias: None, last: id });
        self.stages.push(Stage {
            id,
            name: format!("BASE{id}"),
            base: None,
            external_base: Some(base_ref.to_string()),
            instruction: None,
            dependencies: Vec::new(),
        });
        Ok(())
    }

    /// Resolves an alias or positional index to the last stage of an earlier
    /// Dockerfile-level stage. Only runs below `resolvable_runs` are valid
    /// targets, so self- and forward-references fail here.
    fn resolve(&self, reference: &str, from_stage: &str, resolvable_runs: usize) -> Result<usize> {
        let run = if let Ok(index) = reference.parse::<usize>() {
            (index < resolvable_runs).then_some(index)
        } else {
            self.aliases.get(reference).copied().filter(|run| *run < resolvable_runs)
        };
        match run {
            Some(run) => Ok(self.runs[run].last),
            None => Err(StagecraftError::UnresolvedStageReference {
                stage: from_stage.to_string(),
                reference: reference.to_string(),
            }),
        }
    }
}
