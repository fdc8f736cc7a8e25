//! Steps and the operations they delegate to.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::execution::{ExecutionContext, Invocation, StepResult};

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Export,
    Convert,
    Verify,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::Export => "export",
            StepKind::Convert => "convert",
            StepKind::Verify => "verify",
        })
    }
}

/// Everything an operation is told about the step it runs for.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub step: String,
    pub kind: StepKind,
    pub workspace: PathBuf,
    /// Absolute output location the operation must produce.
    pub output: PathBuf,
    /// Absolute outputs of the required steps, in `requires` order.
    pub inputs: Vec<PathBuf>,
}

/// The unit of work behind a step.
///
/// Implementations must produce `input.output` and must not corrupt an
/// existing valid output if invoked regardless.
#[async_trait]
pub trait StepOperation: Send + Sync {
    async fn run(&self, input: &StepInput, ctx: &mut ExecutionContext) -> StepResult<()>;
}

type StepFuture = Pin<Box<dyn Future<Output = StepResult<()>> + Send>>;
type BoxedStepFn = dyn Fn(StepInput) -> StepFuture + Send + Sync;

/// Operation backed by an injected async closure.
///
/// Runs in-process; the reproduction script names `label` in a comment.
#[derive(Clone)]
pub struct FnOperation {
    label: String,
    func: Arc<BoxedStepFn>,
}

impl FnOperation {
    pub fn new<F, Fut>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            func: Arc::new(move |input| -> StepFuture { Box::pin(func(input)) }),
        }
    }
}

impl fmt::Debug for FnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StepOperation for FnOperation {
    async fn run(&self, input: &StepInput, ctx: &mut ExecutionContext) -> StepResult<()> {
        let invocation = Invocation::in_process(&self.label)
            .arg(input.output.to_string_lossy())
            .current_dir(&input.workspace);
        ctx.execute_local(invocation, (self.func)(input.clone())).await
    }
}

/// Operation running an external program in the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOperation {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandOperation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl StepOperation for CommandOperation {
    async fn run(&self, input: &StepInput, ctx: &mut ExecutionContext) -> StepResult<()> {
        let invocation = Invocation::new(&self.program)
            .args(self.args.iter().cloned())
            .current_dir(&input.workspace);
        ctx.execute_command(invocation).await.map(|_| ())
    }
}

/// A named, cacheable unit of work.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    /// Names of steps that must complete first.
    pub requires: Vec<String>,
    /// Output location relative to the workspace.
    pub output: PathBuf,
    pub operation: Arc<dyn StepOperation>,
}

impl Step {
    pub fn new(
        name: impl Into<String>,
        kind: StepKind,
        output: impl Into<PathBuf>,
        operation: impl StepOperation + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            requires: Vec::new(),
            output: output.into(),
            operation: Arc::new(operation),
        }
    }

    pub fn requires(mut self, step: impl Into<String>) -> Self {
        self.requires.push(step.into());
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("requires", &self.requires)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}
