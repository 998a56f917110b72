//! Build engine.
//!
//! Orchestrates a build: snapshots the context, resolves the stage graph,
//! runs required stages (independent ones concurrently), and assembles the
//! target stage into an image.
//!
//! # Build flow
//!
//! ```text
//! BuildRequest → resolve(stages, target) → snapshot(context)
//!   → run stages as their dependencies finish (bounded by max_parallel_stages)
//!   → ImageAssembler::assemble(target) → pin image root → BuildResult
//! ```
//!
//! Every layer touched while the build runs is pinned under a
//! `build:<uuid>` GC root, released when the build ends.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use a3s_forge_core::config::ForgeConfig;
use a3s_forge_core::error::{ForgeError, Result};
use a3s_forge_core::event::{events, BuildEvent, EventEmitter};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::builder::{LayerBuilder, StageInputs, StageOutput, StageStats};
use crate::cache::{build_root, image_root, CacheStore, DiskCacheStore, PruneReport};
use crate::cancel::CancelToken;
use crate::context::{snapshot, BuildContext, IgnoreRules};
use crate::executor::InstructionExecutor;
use crate::graph::{resolve, BuildPlan, RefKind, Stage};
use crate::hash::Digest;
use crate::image::{Image, ImageAssembler};

/// Input to [`BuildEngine::build_image`].
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub stages: Vec<Stage>,
    /// Stage name or ordinal to build
    pub target: String,
    pub context_root: PathBuf,
    /// Ignore rules; `None` loads `.forgeignore` from the context root
    pub ignore_rules: Option<IgnoreRules>,
    /// Values overriding `ARG` defaults
    pub build_args: HashMap<String, String>,
    /// Execute every step even when a cached layer exists
    pub no_cache: bool,
}

impl BuildRequest {
    pub fn new(
        stages: Vec<Stage>,
        target: impl Into<String>,
        context_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stages,
            target: target.into(),
            context_root: context_root.into(),
            ignore_rules: None,
            build_args: HashMap::new(),
            no_cache: false,
        }
    }

    pub fn with_ignore_rules(mut self, rules: IgnoreRules) -> Self {
        self.ignore_rules = Some(rules);
        self
    }

    pub fn with_build_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(name.into(), value.into());
        self
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }
}

/// What happened to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Built,
    /// Not needed by the target
    Skipped,
}

/// Per-stage summary of a successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub ordinal: usize,
    pub status: StageStatus,
    pub stats: StageStats,
    pub tip: Option<Digest>,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub build_id: Uuid,
    pub image: Image,
    pub context_hash: Digest,
    /// One report per input stage, in ordinal order
    pub stages: Vec<StageReport>,
    /// Totals over all built stages
    pub stats: StageStats,
}

/// Drives builds against a cache store and an executor.
pub struct BuildEngine {
    store: Arc<dyn CacheStore>,
    executor: Arc<dyn InstructionExecutor>,
    config: ForgeConfig,
    events: EventEmitter,
}

impl BuildEngine {
    pub fn new(
        store: Arc<dyn CacheStore>,
        executor: Arc<dyn InstructionExecutor>,
        config: ForgeConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            events: EventEmitter::default(),
        }
    }

    /// Engine backed by a [`DiskCacheStore`] in the configured cache directory.
    pub fn from_config(
        config: ForgeConfig,
        executor: Arc<dyn InstructionExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let store = DiskCacheStore::open(&config.cache.dir)?;
        Ok(Self::new(Arc::new(store), executor, config))
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Build the request's target stage into an image.
    ///
    /// On failure the error names the root-cause stage and instruction;
    /// layers produced before the failure stay cached.
    pub async fn build_image(
        &self,
        request: BuildRequest,
        cancel: CancelToken,
    ) -> Result<BuildResult> {
        let build_id = Uuid::new_v4();
        let root = build_root(&build_id);

        tracing::info!(
            build_id = %build_id,
            target_stage = %request.target,
            stages = request.stages.len(),
            "Build started"
        );
        self.emit(
            events::BUILD_STARTED,
            &[
                ("build_id", build_id.to_string()),
                ("target", request.target.clone()),
            ],
        );

        let result = self.run_build(build_id, &root, request, cancel).await;

        if let Err(e) = self.store.unpin(&root).await {
            tracing::warn!(build_id = %build_id, error = %e, "Failed to release build root");
        }

        match &result {
            Ok(built) => {
                tracing::info!(
                    build_id = %build_id,
                    digest = %built.image.digest,
                    layers = built.image.layers.len(),
                    hits = built.stats.cache_hits,
                    misses = built.stats.cache_misses,
                    "Build completed"
                );
                self.emit(
                    events::BUILD_COMPLETED,
                    &[
                        ("build_id", build_id.to_string()),
                        ("digest", built.image.digest.to_string()),
                    ],
                );
            }
            Err(e @ ForgeError::Cancelled { .. }) => {
                tracing::warn!(build_id = %build_id, error = %e, "Build cancelled");
                self.emit(events::BUILD_CANCELLED, &[("build_id", build_id.to_string())]);
            }
            Err(e) => {
                tracing::error!(build_id = %build_id, error = %e, "Build failed");
                self.emit(
                    events::BUILD_FAILED,
                    &[
                        ("build_id", build_id.to_string()),
                        ("error", e.to_string()),
                    ],
                );
            }
        }

        result
    }

    /// Trim the cache to the configured size limit.
    pub async fn prune_cache(&self) -> Result<PruneReport> {
        let report = self.store.prune_to_size(self.config.cache.max_bytes).await?;
        self.emit(
            events::CACHE_PRUNED,
            &[
                ("layers", report.layers_removed.len().to_string()),
                ("bytes", report.bytes_reclaimed.to_string()),
            ],
        );
        Ok(report)
    }

    async fn run_build(
        &self,
        build_id: Uuid,
        root: &str,
        request: BuildRequest,
        cancel: CancelToken,
    ) -> Result<BuildResult> {
        let plan = Arc::new(resolve(&request.stages, &request.target)?);
        for name in plan.skipped() {
            tracing::debug!(stage = name, "Stage not required by target, skipping");
            self.emit(events::STAGE_SKIPPED, &[("stage", name.to_string())]);
        }

        let context = self
            .snapshot_context(request.context_root.clone(), request.ignore_rules.clone())
            .await?;
        let context_hash = context.root_hash().clone();

        let builder = LayerBuilder::new(self.store.clone(), self.executor.clone(), context)
            .with_cancel(cancel.clone())
            .with_events(self.events.clone())
            .with_pin_root(root)
            .with_no_cache(request.no_cache);

        let outputs = self
            .run_stages(plan.clone(), builder, Arc::new(request.build_args), &cancel)
            .await?;

        let by_name: HashMap<String, StageOutput> = outputs
            .values()
            .map(|o| (o.name.clone(), o.clone()))
            .collect();
        let image = ImageAssembler::assemble(&plan.target().name, &by_name)?;

        if let Some(tip) = image.tip() {
            self.store
                .pin(&image_root(&image.digest), std::slice::from_ref(&tip.hash))
                .await?;
        }

        let mut stats = StageStats::default();
        let stages = request
            .stages
            .iter()
            .enumerate()
            .map(|(ordinal, stage)| match outputs.get(&ordinal) {
                Some(output) => {
                    stats.merge(&output.stats);
                    StageReport {
                        name: stage.name.clone(),
                        ordinal,
                        status: StageStatus::Built,
                        stats: output.stats,
                        tip: output.tip().map(|l| l.hash.clone()),
                    }
                }
                None => StageReport {
                    name: stage.name.clone(),
                    ordinal,
                    status: StageStatus::Skipped,
                    stats: StageStats::default(),
                    tip: None,
                },
            })
            .collect();

        Ok(BuildResult {
            build_id,
            image,
            context_hash,
            stages,
            stats,
        })
    }

    async fn snapshot_context(
        &self,
        root: PathBuf,
        rules: Option<IgnoreRules>,
    ) -> Result<Arc<BuildContext>> {
        let task_root = root.clone();
        let context = tokio::task::spawn_blocking(move || {
            let rules = match rules {
                Some(rules) => rules,
                None => IgnoreRules::from_context(&task_root)?,
            };
            snapshot(&task_root, &rules)
        })
        .await
        .map_err(|e| ForgeError::ContextError {
            path: root,
            message: format!("Snapshot task failed: {}", e),
        })??;
        Ok(Arc::new(context))
    }

    /// Run every required stage once its dependencies are built.
    ///
    /// A failed stage fails its dependents without running them; stages
    /// that do not depend on it keep going. Returns the outputs keyed by
    /// ordinal, or the root-cause error if any required stage did not build.
    async fn run_stages(
        &self,
        plan: Arc<BuildPlan>,
        builder: LayerBuilder,
        build_args: Arc<HashMap<String, String>>,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<usize, StageOutput>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_stages.max(1)));
        let mut outputs: BTreeMap<usize, StageOutput> = BTreeMap::new();
        let mut errors: BTreeMap<usize, ForgeError> = BTreeMap::new();
        let mut pending: Vec<usize> = plan.order().to_vec();
        let mut tasks: JoinSet<(usize, Result<StageOutput>)> = JoinSet::new();

        loop {
            // Launch every pending stage whose dependencies are built
            let mut still_pending = Vec::new();
            let mut cancelled = Vec::new();
            for ordinal in pending {
                let deps = plan.dependencies(ordinal);
                if !deps.iter().all(|d| outputs.contains_key(d)) {
                    still_pending.push(ordinal);
                    continue;
                }
                if cancel.is_cancelled() {
                    errors.insert(
                        ordinal,
                        ForgeError::Cancelled {
                            stage: plan.stage(ordinal).name.clone(),
                            index: 0,
                        },
                    );
                    cancelled.push(ordinal);
                    continue;
                }

                let mut inputs = StageInputs::default();
                for r in plan.references(ordinal) {
                    let Some(output) = outputs.get(&r.ordinal) else {
                        continue;
                    };
                    let slot = match r.kind {
                        RefKind::Base => &mut inputs.bases,
                        RefKind::CopySource => &mut inputs.sources,
                    };
                    slot.insert(r.reference.clone(), output.clone());
                }
                let stage = plan.stage(ordinal).clone();
                let builder = builder.clone();
                let semaphore = semaphore.clone();
                let build_args = build_args.clone();

                tracing::debug!(stage = %stage.name, ordinal, "Stage ready");
                tasks.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (
                                ordinal,
                                Err(ForgeError::Cancelled {
                                    stage: stage.name.clone(),
                                    index: 0,
                                }),
                            )
                        }
                    };
                    let result = builder
                        .build_stage(&stage, ordinal, &inputs, &build_args)
                        .await;
                    (ordinal, result)
                });
                self.emit(
                    events::STAGE_STARTED,
                    &[("stage", plan.stage(ordinal).name.clone())],
                );
            }
            pending = still_pending;
            for ordinal in cancelled {
                self.fail_dependents(&plan, ordinal, &mut pending, &mut errors);
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (ordinal, result) = joined.map_err(|e| {
                ForgeError::AssemblyError(format!("Stage task failed to complete: {}", e))
            })?;
            let name = plan.stage(ordinal).name.clone();
            match result {
                Ok(output) => {
                    self.emit(events::STAGE_COMPLETED, &[("stage", name)]);
                    outputs.insert(ordinal, output);
                }
                Err(err) => {
                    tracing::warn!(stage = %name, error = %err, "Stage failed");
                    self.emit(
                        events::STAGE_FAILED,
                        &[("stage", name), ("error", err.to_string())],
                    );
                    errors.insert(ordinal, err);
                    self.fail_dependents(&plan, ordinal, &mut pending, &mut errors);
                }
            }
        }

        if outputs.contains_key(&plan.target_ordinal()) {
            return Ok(outputs);
        }

        // Report the lowest-ordinal failure that is not a consequence of another
        let root_cause = errors
            .iter()
            .find(|(_, e)| !matches!(e, ForgeError::DependencyFailed { .. }))
            .map(|(&ordinal, _)| ordinal)
            .or_else(|| errors.keys().next().copied());
        match root_cause.and_then(|ordinal| errors.remove(&ordinal)) {
            Some(err) => Err(err),
            None => Err(ForgeError::AssemblyError(format!(
                "target stage '{}' never ran",
                plan.target().name
            ))),
        }
    }

    /// Drop every pending stage downstream of `failed`; none of them can
    /// build.
    fn fail_dependents(
        &self,
        plan: &BuildPlan,
        failed: usize,
        pending: &mut Vec<usize>,
        errors: &mut BTreeMap<usize, ForgeError>,
    ) {
        let dependents = plan.dependents(failed);
        pending.retain(|&ordinal| {
            if !dependents.contains(&ordinal) {
                return true;
            }
            let err = ForgeError::DependencyFailed {
                stage: plan.stage(ordinal).name.clone(),
                dependency: plan.stage(failed).name.clone(),
            };
            tracing::warn!(stage = %plan.stage(ordinal).name, error = %err, "Stage not built");
            self.emit(
                events::STAGE_FAILED,
                &[
                    ("stage", plan.stage(ordinal).name.clone()),
                    ("error", err.to_string()),
                ],
            );
            errors.insert(ordinal, err);
            false
        });
    }

    fn emit(&self, key: &str, fields: &[(&str, String)]) {
        let map = fields
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
            .collect();
        self.events.emit(BuildEvent::with_map(key, map));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::executor::ExecStep;
    use crate::instruction::Instruction;
    use crate::layer::Delta;
    use a3s_forge_core::error::ExecutorError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EchoExecutor;

    #[async_trait]
    impl InstructionExecutor for EchoExecutor {
        async fn execute(
            &self,
            step: &ExecStep<'_>,
        ) -> std::result::Result<Delta, ExecutorError> {
            let summary = step.instruction.to_string();
            if summary.contains("fail") {
                return Err(ExecutorError::CommandFailed {
                    code: 2,
                    message: summary,
                });
            }
            Ok(Delta::Bytes(summary.into_bytes()))
        }
    }

    fn engine(store: Arc<MemoryCacheStore>) -> BuildEngine {
        BuildEngine::new(store, Arc::new(EchoExecutor), ForgeConfig::default())
    }

    fn stages() -> Vec<Stage> {
        vec![Stage::new(
            "app",
            vec![
                Instruction::FromImage {
                    reference: "alpine".to_string(),
                },
                Instruction::Cmd {
                    exec: vec!["app".to_string()],
                },
            ],
        )]
    }

    #[tokio::test]
    async fn test_build_pins_image_and_releases_build_root() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryCacheStore::new());
        let engine = engine(store.clone());

        let result = engine
            .build_image(BuildRequest::new(stages(), "app", tmp.path()), CancelToken::never())
            .await
            .unwrap();

        let roots = store.roots().await.unwrap();
        assert_eq!(roots.len(), 1);
        let pinned = &roots[&image_root(&result.image.digest)];
        assert!(pinned.contains(&result.image.tip().unwrap().hash));
        assert_eq!(result.stages[0].status, StageStatus::Built);
        assert_eq!(result.image.config.cmd, Some(vec!["app".to_string()]));
    }

    #[tokio::test]
    async fn test_graph_error_before_snapshot() {
        let store = Arc::new(MemoryCacheStore::new());
        let err = engine(store)
            .build_image(
                BuildRequest::new(stages(), "missing", "/nonexistent/context"),
                CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn test_context_error() {
        let store = Arc::new(MemoryCacheStore::new());
        let err = engine(store.clone())
            .build_image(
                BuildRequest::new(stages(), "app", "/nonexistent/context"),
                CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::ContextError { .. }));
        assert!(store.roots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_events() {
        let tmp = TempDir::new().unwrap();
        let emitter = EventEmitter::new(64);
        let mut rx = emitter.subscribe();
        let engine = engine(Arc::new(MemoryCacheStore::new())).with_events(emitter);

        engine
            .build_image(BuildRequest::new(stages(), "app", tmp.path()), CancelToken::never())
            .await
            .unwrap();

        let mut keys = Vec::new();
        while let Ok(event) = rx.try_recv() {
            keys.push(event.key);
        }
        assert_eq!(keys.first().map(String::as_str), Some(events::BUILD_STARTED));
        assert_eq!(keys.last().map(String::as_str), Some(events::BUILD_COMPLETED));
        assert!(keys.iter().any(|k| k == events::STAGE_COMPLETED));
    }

    #[tokio::test]
    async fn test_failure_fails_transitive_dependents() {
        let tmp = TempDir::new().unwrap();
        let emitter = EventEmitter::new(64);
        let mut rx = emitter.subscribe();
        let store = Arc::new(MemoryCacheStore::new());
        let engine = engine(store).with_events(emitter);
        let from = |reference: &str| Instruction::FromImage {
            reference: reference.to_string(),
        };
        let stages = vec![
            Stage::new(
                "broken",
                vec![
                    from("alpine"),
                    Instruction::Run {
                        command: "fail".to_string(),
                        inputs: vec![],
                    },
                ],
            ),
            Stage::new("mid", vec![from("broken")]),
            Stage::new(
                "final",
                vec![
                    from("scratch"),
                    Instruction::Copy {
                        src: vec!["/out".to_string()],
                        dest: "/out".to_string(),
                        from: Some("mid".to_string()),
                    },
                ],
            ),
        ];

        let err = engine
            .build_image(BuildRequest::new(stages, "final", tmp.path()), CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(err.failed_step(), Some(("broken", 1)));

        let mut failed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.key == events::STAGE_FAILED {
                failed.push(event.field("stage").cloned());
            }
        }
        assert_eq!(
            failed,
            vec![
                Some(serde_json::json!("broken")),
                Some(serde_json::json!("mid")),
                Some(serde_json::json!("final")),
            ]
        );
    }

    #[tokio::test]
    async fn test_from_config_opens_disk_store() {
        let tmp = TempDir::new().unwrap();
        let mut config = ForgeConfig::default();
        config.cache.dir = tmp.path().join("cache");

        let engine = BuildEngine::from_config(config, Arc::new(EchoExecutor)).unwrap();
        assert!(tmp.path().join("cache").join("layers").is_dir());
        assert!(engine.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_cache_keeps_image_layers() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryCacheStore::new());
        let mut config = ForgeConfig::default();
        config.cache.max_bytes = 0;
        let engine = BuildEngine::new(store.clone(), Arc::new(EchoExecutor), config);

        engine
            .build_image(BuildRequest::new(stages(), "app", tmp.path()), CancelToken::never())
            .await
            .unwrap();
        let report = engine.prune_cache().await.unwrap();
        assert!(report.layers_removed.is_empty());
        assert_eq!(store.len(), 2);
    }
}
