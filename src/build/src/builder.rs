//! LayerBuilder - turns instructions into cached layers.
//!
//! For each instruction the builder derives a [`CacheKey`] from the parent
//! layer, the instruction and the slice of build context it reads. A stored
//! layer under that key is reused as-is; otherwise the executor runs the
//! step and the resulting delta is stored as a new layer.
//!
//! Within a stage, the first miss forces every later step to miss as well,
//! so a re-executed step is never followed by layers derived from the
//! previous execution's output.

use std::collections::HashMap;
use std::sync::Arc;

use a3s_forge_core::error::{ExecutorError, ForgeError, Result};
use a3s_forge_core::event::{events, BuildEvent, EventEmitter};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::cancel::CancelToken;
use crate::context::BuildContext;
use crate::executor::{ExecStep, InstructionExecutor};
use crate::graph::Stage;
use crate::hash::Digest;
use crate::instruction::Instruction;
use crate::layer::{CacheKey, Delta, Layer};

/// One instruction to build.
#[derive(Debug, Clone, Copy)]
pub struct Step<'a> {
    pub stage: &'a str,
    pub index: usize,
    pub parent: Option<&'a Layer>,
    /// Instruction with build arguments already expanded
    pub instruction: &'a Instruction,
    /// Tip of the source stage for `COPY --from`
    pub source: Option<&'a Layer>,
}

/// Result of building one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub layer: Layer,
    pub cached: bool,
    /// Whether the executor was invoked
    pub executed: bool,
}

/// Per-stage cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub executor_calls: usize,
}

impl StageStats {
    fn record(&mut self, outcome: &StepOutcome) {
        if outcome.cached {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
        if outcome.executed {
            self.executor_calls += 1;
        }
    }

    pub fn merge(&mut self, other: &StageStats) {
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.executor_calls += other.executor_calls;
    }
}

/// Layers produced for a stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub name: String,
    pub ordinal: usize,
    /// Root-to-tip chain, including layers inherited through `FROM <stage>`
    pub chain: Vec<Layer>,
    pub stats: StageStats,
}

impl StageOutput {
    pub fn tip(&self) -> Option<&Layer> {
        self.chain.last()
    }
}

/// Outputs of the stages a stage references, keyed by the reference as
/// written in its instructions.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    /// `FROM <stage>` bases the plan resolved to an earlier stage
    pub bases: HashMap<String, StageOutput>,
    /// `COPY --from=<stage>` sources
    pub sources: HashMap<String, StageOutput>,
}

/// Builds layers against a cache store and an executor.
#[derive(Clone)]
pub struct LayerBuilder {
    store: Arc<dyn CacheStore>,
    executor: Arc<dyn InstructionExecutor>,
    context: Arc<BuildContext>,
    cancel: CancelToken,
    events: EventEmitter,
    /// GC root every visited layer is pinned under
    pin_root: Option<String>,
    no_cache: bool,
}

impl LayerBuilder {
    pub fn new(
        store: Arc<dyn CacheStore>,
        executor: Arc<dyn InstructionExecutor>,
        context: Arc<BuildContext>,
    ) -> Self {
        Self {
            store,
            executor,
            context,
            cancel: CancelToken::never(),
            events: EventEmitter::default(),
            pin_root: None,
            no_cache: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Pin every layer this builder touches under `root`, protecting it
    /// from concurrent prunes.
    pub fn with_pin_root(mut self, root: impl Into<String>) -> Self {
        self.pin_root = Some(root.into());
        self
    }

    /// Execute every step even when its layer is stored.
    ///
    /// Layer hashes depend only on the step's inputs, so a step whose hash
    /// is already stored keeps the stored layer and its fresh output is
    /// discarded. Only execution is re-checked.
    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn context(&self) -> &BuildContext {
        &self.context
    }

    /// Cache key for `instruction` on top of `parent`.
    pub fn cache_key(
        &self,
        parent: Option<&Layer>,
        instruction: &Instruction,
        source: Option<&Layer>,
    ) -> Result<CacheKey> {
        let context = if instruction.copy_source_stage().is_some() {
            vec![format!(
                "stage={}",
                source.map(|l| l.hash.as_str()).unwrap_or("")
            )]
        } else if let Some(patterns) = instruction.context_patterns() {
            self.context
                .select(patterns)?
                .into_iter()
                .map(|entry| format!("{}={}", entry.path, entry.digest()))
                .collect()
        } else {
            Vec::new()
        };
        CacheKey::new(parent.map(|p| &p.hash), instruction, context)
    }

    /// Build a single step, reusing a cached layer unless `force_miss`.
    pub async fn build(&self, step: Step<'_>, force_miss: bool) -> Result<StepOutcome> {
        let hash = self
            .cache_key(step.parent, step.instruction, step.source)?
            .digest()?;

        // Pin before looking up so a concurrent prune cannot remove the
        // layer between the lookup and the end of the build.
        if let Some(root) = &self.pin_root {
            self.store.pin(root, std::slice::from_ref(&hash)).await?;
        }

        if !force_miss && !self.no_cache {
            if let Some(layer) = self.store.get(&hash).await? {
                tracing::debug!(
                    stage = step.stage,
                    step = step.index,
                    hash = %hash.short(),
                    "Cache hit"
                );
                self.emit(events::STEP_CACHED, &step, &hash);
                return Ok(StepOutcome {
                    layer,
                    cached: true,
                    executed: false,
                });
            }
        }

        self.check_cancelled(&step)?;

        let executed = !step.instruction.is_metadata_only();
        let delta = if executed {
            tracing::debug!(
                stage = step.stage,
                step = step.index,
                hash = %hash.short(),
                instruction = %step.instruction,
                "Cache miss, executing"
            );
            self.execute(&step).await?
        } else {
            Delta::Empty
        };

        // A step that finished after cancellation is discarded
        self.check_cancelled(&step)?;

        // A forced re-execution may land on a hash that is already stored;
        // the stored record wins and the new delta is never written.
        let layer = match self.store.get(&hash).await? {
            Some(stored) => {
                tracing::debug!(
                    stage = step.stage,
                    step = step.index,
                    hash = %hash.short(),
                    "Layer already stored, discarding re-executed delta"
                );
                stored
            }
            None => self.insert(&step, hash.clone(), delta).await?,
        };

        self.emit(events::STEP_EXECUTED, &step, &hash);
        Ok(StepOutcome {
            layer,
            cached: false,
            executed,
        })
    }

    /// Build every instruction of `stage` in order.
    ///
    /// A `FROM` whose reference is not among `inputs.bases` names an
    /// external image.
    pub async fn build_stage(
        &self,
        stage: &Stage,
        ordinal: usize,
        inputs: &StageInputs,
        build_args: &HashMap<String, String>,
    ) -> Result<StageOutput> {
        let mut args: HashMap<String, String> = HashMap::new();
        let mut chain: Vec<Layer> = Vec::new();
        let mut stats = StageStats::default();
        let mut force_miss = false;

        for (index, raw) in stage.instructions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(ForgeError::Cancelled {
                    stage: stage.name.clone(),
                    index,
                });
            }

            let instruction = match raw {
                Instruction::Arg { name, default } => {
                    let value = build_args.get(name).or(default.as_ref()).cloned();
                    if let Some(value) = &value {
                        args.insert(name.clone(), value.clone());
                    }
                    Instruction::Arg {
                        name: name.clone(),
                        default: value,
                    }
                }
                Instruction::FromImage { reference } => {
                    if let Some(base) = inputs.bases.get(reference) {
                        tracing::debug!(
                            stage = %stage.name,
                            base = %base.name,
                            "Continuing from stage"
                        );
                        chain = base.chain.clone();
                        continue;
                    }
                    chain.clear();
                    raw.expand(&args)
                }
                _ => raw.expand(&args),
            };

            let source = match raw.copy_source_stage() {
                Some(reference) => match inputs.sources.get(reference) {
                    Some(output) => output.tip(),
                    None => {
                        return Err(ForgeError::UnknownStage {
                            name: reference.to_string(),
                            referenced_by: stage.name.clone(),
                        })
                    }
                },
                None => None,
            };

            let outcome = self
                .build(
                    Step {
                        stage: &stage.name,
                        index,
                        parent: chain.last(),
                        instruction: &instruction,
                        source,
                    },
                    force_miss,
                )
                .await?;

            stats.record(&outcome);
            if !outcome.cached {
                force_miss = true;
            }
            chain.push(outcome.layer);
        }

        tracing::info!(
            stage = %stage.name,
            layers = chain.len(),
            hits = stats.cache_hits,
            misses = stats.cache_misses,
            "Stage built"
        );

        Ok(StageOutput {
            name: stage.name.clone(),
            ordinal,
            chain,
            stats,
        })
    }

    async fn insert(&self, step: &Step<'_>, hash: Digest, delta: Delta) -> Result<Layer> {
        let blob = match delta {
            Delta::Bytes(bytes) if !bytes.is_empty() => Some(self.store.put_blob(bytes).await?),
            _ => None,
        };
        let layer = Layer {
            hash: hash.clone(),
            parent: step.parent.map(|p| p.hash.clone()),
            produced_by: step.instruction.clone(),
            delta: blob,
            created_at: chrono::Utc::now(),
        };
        self.store.put(layer.clone()).await?;

        // A concurrent build may have stored the same hash first
        Ok(self.store.get(&hash).await?.unwrap_or(layer))
    }

    async fn execute(&self, step: &Step<'_>) -> Result<Delta> {
        let exec = ExecStep {
            stage: step.stage,
            index: step.index,
            parent: step.parent,
            instruction: step.instruction,
            context: &self.context,
            source: step.source,
            cancel: &self.cancel,
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExecutorError::Cancelled),
            result = self.executor.execute(&exec) => result,
        };

        result.map_err(|source| match source {
            ExecutorError::Cancelled => ForgeError::Cancelled {
                stage: step.stage.to_string(),
                index: step.index,
            },
            source => ForgeError::ExecutionError {
                stage: step.stage.to_string(),
                index: step.index,
                instruction: step.instruction.to_string(),
                source,
            },
        })
    }

    fn check_cancelled(&self, step: &Step<'_>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ForgeError::Cancelled {
                stage: step.stage.to_string(),
                index: step.index,
            });
        }
        Ok(())
    }

    fn emit(&self, key: &str, step: &Step<'_>, hash: &Digest) {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(step.stage));
        map.insert("step".to_string(), serde_json::json!(step.index));
        map.insert("hash".to_string(), serde_json::json!(hash.as_str()));
        self.events.emit(BuildEvent::with_map(key, map));
    }
}
