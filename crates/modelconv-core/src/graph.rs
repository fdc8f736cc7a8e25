//! Step dependency graph and sequential execution.
//!
//! Steps form a DAG through their `requires` lists. The graph is validated
//! and ordered once at construction time (Kahn's algorithm, ties broken by
//! declaration order); a cycle is a configuration error and nothing runs.
//!
//! Execution is strictly sequential. Before a step runs its output path is
//! checked against the [`CachePolicy`]: a satisfied output marks the step
//! SKIPPED, which counts as success for dependents. A failed step turns
//! every transitive dependent into DEPENDENCY_FAILED without invoking it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{self, CachePolicy, CacheState};
use crate::error::{ConfigError, ConfigResult, StepError};
use crate::execution::{ExecutionContext, Reproduction};
use crate::obs;
use crate::step::{Step, StepInput, StepKind};

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    DependencyFailed,
}

impl StepStatus {
    /// Whether dependents may run after this outcome.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Succeeded => "SUCCEEDED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::DependencyFailed => "DEPENDENCY_FAILED",
        })
    }
}

/// Outcome of executing one step once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub step: String,
    pub kind: StepKind,
    pub status: StepStatus,
    /// Absolute output path, set when the step is satisfied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reproduction: Option<Reproduction>,
    pub duration_ms: u64,
}

impl StepRun {
    fn without_execution(step: &Step, status: StepStatus) -> Self {
        Self {
            step: step.name.clone(),
            kind: step.kind,
            status,
            output: None,
            log: String::new(),
            error: None,
            reproduction: None,
            duration_ms: 0,
        }
    }
}

/// Options for [`CommandGraph::run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub verbose: bool,
    pub cache_policy: CachePolicy,
}

/// A validated, topologically ordered set of steps.
#[derive(Debug, Clone)]
pub struct CommandGraph {
    steps: Vec<Step>,
    /// Indices into `steps` in execution order.
    order: Vec<usize>,
}

impl CommandGraph {
    /// Validate and order `steps`.
    ///
    /// Rejects duplicate names, requirements naming unknown steps and
    /// dependency cycles.
    pub fn new(steps: Vec<Step>) -> ConfigResult<Self> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.name.as_str(), i).is_some() {
                return Err(ConfigError::DuplicateStep(step.name.clone()));
            }
        }

        // upstream[i] = indices step i requires
        let mut upstream: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
        for step in &steps {
            let mut deps = Vec::with_capacity(step.requires.len());
            for name in &step.requires {
                let dep = index
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| ConfigError::UnknownDependency {
                        step: step.name.clone(),
                        missing: name.clone(),
                    })?;
                deps.push(dep);
            }
            upstream.push(deps);
        }

        let order = topological_order(&upstream).map_err(|cycle| ConfigError::DependencyCycle {
            steps: cycle.into_iter().map(|i| steps[i].name.clone()).collect(),
        })?;

        Ok(Self { steps, order })
    }

    /// Steps in execution order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step once, in order, inside `workspace`.
    ///
    /// Step failures are recorded in the returned runs, never raised.
    pub async fn run(&self, workspace: &Path, options: &RunOptions) -> Vec<StepRun> {
        let mut status: HashMap<&str, StepStatus> = HashMap::with_capacity(self.steps.len());
        let mut runs = Vec::with_capacity(self.steps.len());

        for step in self.ordered_steps() {
            let failed_dep = step
                .requires
                .iter()
                .find(|r| !status.get(r.as_str()).is_some_and(StepStatus::is_satisfied));

            let run = match failed_dep {
                Some(dep) => {
                    debug!(step = %step.name, requires = %dep, "Not running step: requirement failed");
                    StepRun {
                        error: Some(format!("required step {dep} did not succeed")),
                        ..StepRun::without_execution(step, StepStatus::DependencyFailed)
                    }
                }
                None => self.run_step(step, workspace, options).await,
            };

            obs::emit_step_finished(&run.step, &run.status, run.duration_ms);
            status.insert(step.name.as_str(), run.status);
            runs.push(run);
        }
        runs
    }

    async fn run_step(&self, step: &Step, workspace: &Path, options: &RunOptions) -> StepRun {
        let output = workspace.join(&step.output);

        match options.cache_policy.check(&output) {
            CacheState::Satisfied => {
                debug!(step = %step.name, output = ?output, "Output exists, skipping step");
                return StepRun {
                    output: Some(output),
                    ..StepRun::without_execution(step, StepStatus::Skipped)
                };
            }
            CacheState::Stale => {
                warn!(step = %step.name, output = ?output, "Output has no valid completion marker, rebuilding");
                if let Err(e) = cache::invalidate(&output) {
                    return StepRun {
                        error: Some(format!("cannot remove stale output: {e}")),
                        ..StepRun::without_execution(step, StepStatus::Failed)
                    };
                }
            }
            CacheState::Missing => {}
        }

        let start = Instant::now();
        let mut ctx = ExecutionContext::for_step(workspace, &step.name, options.verbose);
        let input = StepInput {
            step: step.name.clone(),
            kind: step.kind,
            workspace: workspace.to_path_buf(),
            output: output.clone(),
            inputs: step
                .requires
                .iter()
                .filter_map(|r| self.steps.iter().find(|s| &s.name == r))
                .map(|s| workspace.join(&s.output))
                .collect(),
        };

        let outcome = match output.parent().map(std::fs::create_dir_all) {
            Some(Err(e)) => Err(StepError::Io(e)),
            _ => step.operation.run(&input, &mut ctx).await,
        };
        let outcome = outcome.and_then(|()| {
            if output.exists() {
                Ok(())
            } else {
                Err(StepError::MissingOutput(output.clone()))
            }
        });

        let log = ctx.log().to_string();
        let reproduction = match ctx.finish() {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(step = %step.name, error = %e, "Failed to write reproduction script");
                None
            }
        };

        let (status, error) = match outcome {
            Ok(()) => {
                if let Err(e) = options.cache_policy.record(&output) {
                    warn!(step = %step.name, error = %e, "Failed to write completion marker");
                }
                (StepStatus::Succeeded, None)
            }
            Err(e) => {
                warn!(step = %step.name, error = %e, "Step failed");
                (StepStatus::Failed, Some(e.to_string()))
            }
        };

        StepRun {
            step: step.name.clone(),
            kind: step.kind,
            status,
            output: status.is_satisfied().then_some(output),
            log,
            error,
            reproduction,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Kahn's algorithm over `upstream` adjacency. Among ready steps the one
/// declared first runs first. On a cycle, returns the steps forming it.
fn topological_order(upstream: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = upstream.len();
    let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, deps) in upstream.iter().enumerate() {
        for &d in deps {
            downstream[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        sorted.push(i);
        for &next in &downstream[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if sorted.len() == n {
        return Ok(sorted);
    }
    let remaining: Vec<usize> = (0..n).filter(|&i| in_degree[i] > 0).collect();
    Err(find_cycle(upstream, &remaining).unwrap_or(remaining))
}

/// DFS over the steps left by Kahn's algorithm for one concrete cycle.
fn find_cycle(upstream: &[Vec<usize>], remaining: &[usize]) -> Option<Vec<usize>> {
    let candidates: HashSet<usize> = remaining.iter().copied().collect();
    let start = *remaining.first()?;

    let mut path = vec![start];
    let mut on_path: HashSet<usize> = HashSet::from([start]);
    let mut current = start;
    // Every remaining node has a remaining predecessor, so this walk never
    // dead-ends and must revisit a node within `remaining.len()` moves.
    for _ in 0..=remaining.len() {
        let next = *upstream[current].iter().find(|d| candidates.contains(d))?;
        if on_path.contains(&next) {
            let pos = path.iter().position(|&p| p == next)?;
            let mut cycle = path.split_off(pos);
            cycle.reverse();
            return Some(cycle);
        }
        path.push(next);
        on_path.insert(next);
        current = next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::FnOperation;

    fn writer(name: &str, output: &str) -> Step {
        Step::new(
            name,
            StepKind::Export,
            output,
            FnOperation::new("write", |input: StepInput| async move {
                std::fs::write(&input.output, b"ok")?;
                Ok::<(), StepError>(())
            }),
        )
    }

    fn names(graph: &CommandGraph) -> Vec<&str> {
        graph.ordered_steps().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_order_respects_requires_and_declaration() {
        let graph = CommandGraph::new(vec![
            writer("convert", "c").requires("export"),
            writer("verify", "v").requires("convert"),
            writer("export", "e"),
            writer("other", "o"),
        ])
        .unwrap();
        // Among ready steps the earliest declared wins: convert (declared
        // first) becomes ready after export and runs before other.
        assert_eq!(names(&graph), vec!["export", "convert", "verify", "other"]);
    }

    #[test]
    fn test_independent_steps_keep_declaration_order() {
        let graph = CommandGraph::new(vec![
            writer("b", "b"),
            writer("a", "a"),
            writer("c", "c").requires("a"),
        ])
        .unwrap();
        assert_eq!(names(&graph), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_is_rejected_with_members() {
        let err = CommandGraph::new(vec![
            writer("root", "r"),
            writer("a", "a").requires("root").requires("c"),
            writer("b", "b").requires("a"),
            writer("c", "c").requires("b"),
        ])
        .unwrap_err();
        match err {
            ConfigError::DependencyCycle { mut steps } => {
                steps.sort();
                assert_eq!(steps, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = CommandGraph::new(vec![writer("a", "a").requires("a")]).unwrap_err();
        assert!(matches!(err, ConfigError::DependencyCycle { .. }));
    }

    #[test]
    fn test_unknown_and_duplicate_steps_rejected() {
        assert!(matches!(
            CommandGraph::new(vec![writer("a", "a").requires("ghost")]),
            Err(ConfigError::UnknownDependency { .. })
        ));
        assert!(matches!(
            CommandGraph::new(vec![writer("a", "a"), writer("a", "b")]),
            Err(ConfigError::DuplicateStep(_))
        ));
    }

    #[tokio::test]
    async fn test_run_succeeds_and_records_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let graph = CommandGraph::new(vec![
            writer("export", "onnx/model.onnx"),
            writer("convert", "trt/model.plan").requires("export"),
        ])
        .unwrap();
        let runs = graph.run(dir.path(), &RunOptions::default()).await;

        assert!(runs.iter().all(|r| r.status == StepStatus::Succeeded));
        assert_eq!(runs[1].output, Some(dir.path().join("trt/model.plan")));
        assert!(runs[0].reproduction.as_ref().unwrap().script_path.exists());
    }

    #[tokio::test]
    async fn test_operation_without_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = Step::new(
            "lazy",
            StepKind::Convert,
            "lazy/model.plan",
            FnOperation::new("noop", |_input: StepInput| async move { Ok::<(), StepError>(()) }),
        );
        let runs = CommandGraph::new(vec![lazy])
            .unwrap()
            .run(dir.path(), &RunOptions::default())
            .await;
        assert_eq!(runs[0].status, StepStatus::Failed);
        assert!(runs[0].error.as_ref().unwrap().contains("no output"));
    }

    #[tokio::test]
    async fn test_completion_marker_policy_reruns_unmarked_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("onnx")).unwrap();
        std::fs::write(dir.path().join("onnx/model.onnx"), b"trunc").unwrap();

        let graph = CommandGraph::new(vec![writer("export", "onnx/model.onnx")]).unwrap();
        let options = RunOptions {
            verbose: false,
            cache_policy: CachePolicy::CompletionMarker,
        };

        let first = graph.run(dir.path(), &options).await;
        assert_eq!(first[0].status, StepStatus::Succeeded);
        assert_eq!(std::fs::read(dir.path().join("onnx/model.onnx")).unwrap(), b"ok");

        let second = graph.run(dir.path(), &options).await;
        assert_eq!(second[0].status, StepStatus::Skipped);
    }
}
