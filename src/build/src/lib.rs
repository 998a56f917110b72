//! A3S Forge Build - layered image builds with a content-addressed cache.
//!
//! Consumes already-parsed build stages and a context directory and
//! produces an ordered layer chain plus an image descriptor. Instruction
//! execution is delegated to an [`InstructionExecutor`]; this crate owns
//! the cache keys, the layer store and the stage graph.
//!
//! # Example
//!
//! ```ignore
//! let engine = BuildEngine::from_config(ForgeConfig::default(), executor)?;
//! let request = BuildRequest::new(stages, "final", "./app");
//! let result = engine.build_image(request, CancelToken::never()).await?;
//! println!("{}", result.image.digest);
//! ```

pub mod builder;
pub mod cache;
pub mod cancel;
pub mod context;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod hash;
pub mod image;
pub mod instruction;
pub mod layer;

// Re-export commonly used types
pub use builder::{LayerBuilder, StageInputs, StageOutput, StageStats, Step, StepOutcome};
pub use cache::{CacheStore, DiskCacheStore, LayerRecord, MemoryCacheStore, PruneReport};
pub use cancel::{CancelHandle, CancelToken};
pub use context::{snapshot, BuildContext, ContextEntry, EntryKind, IgnoreRules};
pub use engine::{BuildEngine, BuildRequest, BuildResult, StageReport, StageStatus};
pub use executor::{ExecStep, InstructionExecutor};
pub use graph::{resolve, BuildPlan, RefKind, Stage, StageRef};
pub use hash::Digest;
pub use image::{Image, ImageAssembler, RuntimeConfig};
pub use instruction::{Instruction, Protocol};
pub use layer::{BlobRef, CacheKey, Delta, Layer};

pub use a3s_forge_core::{ExecutorError, ForgeConfig, ForgeError, Result};
