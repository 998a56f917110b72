//! InstructionExecutor - the seam to whatever actually runs instructions.
//!
//! The engine never spawns processes or touches a root filesystem itself.
//! On a cache miss it hands the step to an executor and stores whatever
//! delta comes back.

use a3s_forge_core::error::ExecutorError;
use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::context::BuildContext;
use crate::instruction::Instruction;
use crate::layer::{Delta, Layer};

/// Everything an executor needs to run one instruction.
#[derive(Clone, Copy)]
pub struct ExecStep<'a> {
    /// Stage being built
    pub stage: &'a str,
    /// Index of the instruction within the stage
    pub index: usize,
    /// Layer the instruction applies on top of; `None` for a root `FROM`
    pub parent: Option<&'a Layer>,
    /// Instruction with build arguments already expanded
    pub instruction: &'a Instruction,
    pub context: &'a BuildContext,
    /// Tip of the source stage for `COPY --from`
    pub source: Option<&'a Layer>,
    /// Executors should abandon work once this fires
    pub cancel: &'a CancelToken,
}

/// Trait for instruction execution backends.
#[async_trait]
pub trait InstructionExecutor: Send + Sync {
    /// Run a step and return the filesystem delta it produced.
    async fn execute(&self, step: &ExecStep<'_>) -> std::result::Result<Delta, ExecutorError>;
}
