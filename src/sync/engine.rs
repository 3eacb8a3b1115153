//! Run driver: download, dispatch, per-scope phases, sweep.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};

use super::context::{CancelToken, ScopeContext};
use super::dispatch::{DispatchState, Dispatcher};
use super::orchestrator::Orchestrator;
use super::stats::RunStats;
use super::sweep::Sweeper;
use crate::adapter::SourceAdapter;
use crate::config::RunOptions;
use crate::persistence::{migrations, CorrespondenceStore, DuckDbStore, StoreResult};
use crate::pipeline::image::{AssumeReachable, ImageProbe};
use crate::pipeline::stages::DefaultCountryCode;
use crate::pipeline::Pipeline;
use crate::platform::{MutationGateway, TargetPlatform};
use crate::staging::{ErrorSink, StagingQueue};
use crate::types::{CorrespondenceId, ScopeId, SourceRecord};

/// Path of the correspondence database under a working directory.
pub fn database_path(working_dir: &Path) -> std::path::PathBuf {
    working_dir.join("db").join("sync.duckdb")
}

/// Idempotent synchronization of one source into one target platform.
pub struct SyncEngine {
    adapter: Arc<dyn SourceAdapter>,
    platform: Arc<dyn TargetPlatform>,
    store: Arc<dyn CorrespondenceStore>,
    image_probe: Arc<dyn ImageProbe>,
    cancel: CancelToken,
}

/// Everything a run needs besides the engine itself.
struct RunScope<'a> {
    options: &'a RunOptions,
    run_start: DateTime<Utc>,
    cancel: CancelToken,
    queue: StagingQueue,
    sink: ErrorSink,
    gateway: MutationGateway,
    pipeline: Pipeline,
    country_code: DefaultCountryCode,
}

/// What the sweep must know about the passes of a run.
#[derive(Debug, Default)]
struct PassOutcome {
    ignored_deletes: HashSet<String>,
    confirmed: HashSet<(ScopeId, CorrespondenceId)>,
    failed_scopes: HashSet<ScopeId>,
}

/// Where a pass reads its records from.
enum Feed {
    /// Staged files, removed once dispatched.
    Staged,
    /// Records kept in memory (simulated runs never stage).
    Memory(Vec<SourceRecord>),
}

impl SyncEngine {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        platform: Arc<dyn TargetPlatform>,
        store: Arc<dyn CorrespondenceStore>,
    ) -> Self {
        Self {
            adapter,
            platform,
            store,
            image_probe: Arc::new(AssumeReachable),
            cancel: CancelToken::new(),
        }
    }

    /// Engine backed by the DuckDB store of `working_dir`.
    pub fn open(
        adapter: Arc<dyn SourceAdapter>,
        platform: Arc<dyn TargetPlatform>,
        working_dir: &Path,
    ) -> StoreResult<Self> {
        let store = DuckDbStore::open(database_path(working_dir))?;
        Ok(Self::new(adapter, platform, Arc::new(store)))
    }

    pub fn with_image_probe(mut self, probe: Arc<dyn ImageProbe>) -> Self {
        self.image_probe = probe;
        self
    }

    /// Token aborting the run at the next iteration boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &dyn CorrespondenceStore {
        self.store.as_ref()
    }

    /// Run one synchronization. Always returns statistics; failures that stop
    /// the run early are reported in `source_error` or `fatal_error`.
    pub async fn run(&self, options: &RunOptions) -> RunStats {
        let run_start = Utc::now();
        let mut stats = RunStats::new(run_start);
        info!(run_id = %stats.run_id, simulate = options.simulate, "synchronization started");

        if let Err(err) = self.execute(options, run_start, &mut stats).await {
            error!(run_id = %stats.run_id, error = %format!("{err:#}"), "synchronization aborted");
            stats.fatal_error = Some(format!("{err:#}"));
        }

        stats.finished_at = Some(Utc::now());
        info!(
            run_id = %stats.run_id,
            created = stats.total(|s| s.created_events),
            updated = stats.total(|s| s.updated_events),
            up_to_date = stats.total(|s| s.up_to_date_events),
            removed = stats.total(|s| s.removed_events),
            "synchronization finished"
        );
        stats
    }

    async fn execute(
        &self,
        options: &RunOptions,
        run_start: DateTime<Utc>,
        stats: &mut RunStats,
    ) -> Result<()> {
        options.validate().context("Invalid run options")?;

        let working_dir = options.working_dir();
        let run = RunScope {
            options,
            run_start,
            cancel: match options.run_timeout_secs {
                Some(secs) => self.cancel.with_timeout(Duration::from_secs(secs)),
                None => self.cancel.clone(),
            },
            queue: StagingQueue::open(&working_dir)
                .await
                .with_context(|| format!("Failed to open staging area in {}", working_dir.display()))?,
            sink: ErrorSink::open(&working_dir, run_start)
                .await
                .with_context(|| format!("Failed to open error sink in {}", working_dir.display()))?,
            gateway: MutationGateway::new(Arc::clone(&self.platform)).with_image_fallback(
                options.no_bail_on_invalid_image,
                options.default_image_url.clone(),
            ),
            pipeline: Pipeline::standard(options, Arc::clone(&self.image_probe))
                .context("Invalid map-stage pipeline")?,
            country_code: DefaultCountryCode::new(options.default_country_code.clone()),
        };

        if !options.simulate {
            let applied = migrations::run_pending(self.store.as_ref())
                .context("Failed to run store migrations")?;
            if !applied.is_empty() {
                info!(migrations = ?applied, "store migrations applied");
            }
        }

        let mut outcome = PassOutcome::default();

        if !options.simulate && !options.download_only && run.queue.has_pending().await? {
            warn!("staged records left by an interrupted run, resuming them first");
            stats.resumed = true;
            let sink = run.sink.labelled("resume");
            self.pass(&run, &sink, Feed::Staged, stats, &mut outcome).await?;
            if run.cancel.is_cancelled() {
                stats.cancelled = true;
                return Ok(());
            }
        }

        let Some(feed) = self.download(&run, stats).await? else {
            return Ok(());
        };
        if run.cancel.is_cancelled() {
            stats.cancelled = true;
            return Ok(());
        }
        if options.download_only {
            info!(records = stats.downloaded_records, "download only, stopping");
            return Ok(());
        }

        self.pass(&run, &run.sink, feed, stats, &mut outcome).await?;
        if run.cancel.is_cancelled() {
            warn!("run cancelled, skipping sweep");
            stats.cancelled = true;
            return Ok(());
        }

        let sweeper = Sweeper {
            gateway: &run.gateway,
            store: self.store.as_ref(),
            sink: &run.sink,
            cancel: &run.cancel,
            simulate: options.simulate,
            excluded_scopes: &outcome.failed_scopes,
            ignored_deletes: &outcome.ignored_deletes,
            confirmed: &outcome.confirmed,
        };
        sweeper.sweep(run.run_start, stats).await?;
        stats.swept = !stats.cancelled;
        Ok(())
    }

    /// List the source page by page. Records are staged after any file
    /// already pending, or kept in memory when simulating. `None` means the
    /// listing failed.
    async fn download(&self, run: &RunScope<'_>, stats: &mut RunStats) -> Result<Option<Feed>> {
        let limit = run.options.page_size;
        let mut memory = Vec::new();
        let mut offset = 0;
        let mut index = if run.options.simulate {
            0
        } else {
            run.queue
                .next_index()
                .await
                .context("Failed to list staged records")?
        };

        loop {
            if run.cancel.is_cancelled() {
                break;
            }
            let page = match self.adapter.list(offset, limit).await {
                Ok(page) => page,
                Err(err) => {
                    error!(offset, error = %format!("{err:#}"), "source listing failed");
                    stats.source_error = Some(format!("{err:#}"));
                    return Ok(None);
                }
            };
            if page.is_empty() {
                break;
            }
            offset += page.len();

            for record in page {
                if run.options.simulate {
                    memory.push(record);
                } else {
                    run.queue
                        .stage(index, &record)
                        .await
                        .context("Failed to stage source record")?;
                    index += 1;
                }
                stats.downloaded_records += 1;
            }
            info!(downloaded = stats.downloaded_records, "source page downloaded");
        }

        Ok(Some(if run.options.simulate {
            Feed::Memory(memory)
        } else {
            Feed::Staged
        }))
    }

    /// Dispatch every record of `feed`, then run the scope phases.
    async fn pass(
        &self,
        run: &RunScope<'_>,
        sink: &ErrorSink,
        feed: Feed,
        stats: &mut RunStats,
        outcome: &mut PassOutcome,
    ) -> Result<()> {
        let dispatcher = Dispatcher {
            adapter: self.adapter.as_ref(),
            platform: self.platform.as_ref(),
            store: self.store.as_ref(),
            pipeline: &run.pipeline,
            country_code: &run.country_code,
            sink,
            options: run.options,
        };
        let mut state = DispatchState::default();

        match feed {
            Feed::Staged => {
                let files = run.queue.pending().await.context("Failed to list staged records")?;
                info!(records = files.len(), "dispatching staged records");
                for file in files {
                    if run.cancel.is_cancelled() {
                        break;
                    }
                    match run.queue.read(&file).await {
                        Ok(record) => {
                            dispatcher
                                .dispatch(&mut state, stats, &file.name(), &record)
                                .await;
                        }
                        Err(err) => {
                            let err = crate::error::SyncError::from(err)
                                .context("Failed to read staged record");
                            error!(record = %file.name(), error = %err, "dispatch error");
                            stats.dispatch_errors += 1;
                            sink.record(&file.name(), &err, None).await;
                        }
                    }
                    run.queue
                        .remove(&file)
                        .await
                        .context("Failed to remove staged record")?;
                }
            }
            Feed::Memory(records) => {
                for (index, record) in records.iter().enumerate() {
                    if run.cancel.is_cancelled() {
                        break;
                    }
                    let name = format!("record.{index}.json");
                    dispatcher.dispatch(&mut state, stats, &name, record).await;
                }
            }
        }

        outcome.failed_scopes.extend(state.failed_scopes);
        let contexts: Vec<ScopeContext> = state.contexts.into_values().collect();

        let orchestrator = Orchestrator {
            adapter: self.adapter.as_ref(),
            gateway: &run.gateway,
            store: self.store.as_ref(),
            pipeline: &run.pipeline,
            sink,
            options: run.options,
            cancel: &run.cancel,
        };
        let orchestrator = &orchestrator;
        let finished: Vec<ScopeContext> = stream::iter(contexts)
            .map(move |ctx| orchestrator.process_scope(ctx))
            .buffer_unordered(run.options.max_concurrent_scopes)
            .collect()
            .await;

        for ctx in finished {
            let ScopeContext {
                scope_id,
                stats: scope_stats,
                ignored_deletes,
                confirmed,
                ..
            } = ctx;
            outcome.ignored_deletes.extend(ignored_deletes);
            outcome
                .confirmed
                .extend(confirmed.into_iter().map(|cid| (scope_id.clone(), cid)));
            stats.scopes.insert(scope_id, scope_stats);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteError, RemoteErrorKind};
    use crate::sync::stats::ErrorKey;
    use crate::test_utils::{MockPlatform, MockSource};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        source: Arc<MockSource>,
        platform: Arc<MockPlatform>,
        store: Arc<DuckDbStore>,
        engine: SyncEngine,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let source = Arc::new(MockSource::new());
            let platform = Arc::new(MockPlatform::new());
            let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
            let engine = SyncEngine::new(source.clone(), platform.clone(), store.clone());
            Self {
                dir,
                source,
                platform,
                store,
                engine,
            }
        }

        fn options(&self) -> RunOptions {
            RunOptions {
                working_dir: Some(self.dir.path().to_path_buf()),
                default_country_code: None,
                ..Default::default()
            }
        }

        async fn run(&self) -> RunStats {
            self.engine.run(&self.options()).await
        }

        async fn run_with(&self, options: RunOptions) -> RunStats {
            self.engine.run(&options).await
        }
    }

    fn hours(hours: &[u32]) -> Value {
        Value::Array(
            hours
                .iter()
                .map(|h| {
                    json!({
                        "begin": format!("2024-05-01T{h:02}:00:00Z"),
                        "end": format!("2024-05-01T{h:02}:30:00Z"),
                    })
                })
                .collect(),
        )
    }

    fn event(id: &str, location: &str, timings: Value) -> Value {
        json!({
            "id": id,
            "scope": "a",
            "updatedAt": "2024-01-01T00:00:00Z",
            "title": format!("Event {id}"),
            "slug": id,
            "timings": timings,
            "locations": [{"id": location, "name": format!("Place {location}")}],
        })
    }

    fn updated_at(mut record: Value, updated_at: Option<String>) -> Value {
        match updated_at {
            Some(at) => record["updatedAt"] = Value::String(at),
            None => {
                record.as_object_mut().unwrap().remove("updatedAt");
            }
        }
        record
    }

    fn scope(stats: &RunStats) -> &crate::sync::stats::ScopeStats {
        stats.scope("a").unwrap()
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let h = Harness::new();
        h.source.set_records(vec![event("e1", "l1", hours(&[10, 12]))]);

        let first = h.run().await;
        assert!(first.fatal_error.is_none());
        assert_eq!(scope(&first).created_events, 1);
        assert_eq!(scope(&first).created_locations, 1);
        assert!(first.swept);

        let second = h.run().await;
        assert_eq!(scope(&second).created_events, 0);
        assert_eq!(scope(&second).updated_events, 0);
        assert_eq!(scope(&second).up_to_date_events, 1);
        assert_eq!(scope(&second).removed_events, 0);
        assert_eq!(h.platform.calls_named("create_event"), 1);
        assert_eq!(h.platform.calls_named("update_event"), 0);
        assert_eq!(h.platform.calls_named("create_location"), 1);
        assert_eq!(h.store.count_sync_records().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_force_update_bypasses_no_op() {
        let h = Harness::new();
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);
        h.run().await;

        let stats = h
            .run_with(RunOptions {
                force_update: true,
                ..h.options()
            })
            .await;
        assert_eq!(scope(&stats).updated_events, 1);
        assert_eq!(scope(&stats).up_to_date_events, 0);
    }

    #[tokio::test]
    async fn test_records_sharing_correspondence_id_merge() {
        let h = Harness::new();
        h.source.set_records(vec![
            event("e1", "l1", hours(&[10])),
            event("e1", "l1", hours(&[10, 14])),
        ]);

        let stats = h.run().await;
        assert_eq!(scope(&stats).created_events, 1);
        assert_eq!(scope(&stats).merged_source_events, 1);
        assert_eq!(scope(&stats).merged_by_id["e1.l1"], 2);

        let created = h.platform.created_events();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].timings.len(), 2);
    }

    #[tokio::test]
    async fn test_chunks_grow_with_new_timings() {
        let h = Harness::new();
        let options = RunOptions {
            chunk_capacity: 2,
            ..h.options()
        };
        h.source.set_records(vec![event("e1", "l1", hours(&[8, 9, 10]))]);
        let first = h.run_with(options.clone()).await;
        assert_eq!(scope(&first).created_events, 2);
        assert_eq!(scope(&first).split_source_events, 1);

        h.source.set_records(vec![event("e1", "l1", hours(&[8, 9, 10, 11, 12]))]);
        let second = h.run_with(options).await;
        assert_eq!(scope(&second).updated_events, 2);
        assert_eq!(scope(&second).created_events, 1);

        let records = h.store.find_sync_records("a", "e1.l1").unwrap();
        let indexes: Vec<u32> = records.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(records[2].target_data.timings.len(), 1);
    }

    #[tokio::test]
    async fn test_chunks_shrink_with_fewer_timings() {
        let h = Harness::new();
        let options = RunOptions {
            chunk_capacity: 2,
            ..h.options()
        };
        h.source.set_records(vec![event("e1", "l1", hours(&[8, 9, 10, 11, 12]))]);
        h.run_with(options.clone()).await;
        assert_eq!(h.store.count_sync_records().unwrap(), 3);

        h.source.set_records(vec![event("e1", "l1", hours(&[8]))]);
        let stats = h.run_with(options).await;
        assert_eq!(scope(&stats).updated_events, 1);
        assert_eq!(scope(&stats).removed_events, 2);
        assert_eq!(h.store.count_sync_records().unwrap(), 1);
        assert_eq!(h.platform.calls_named("delete_event"), 2);
        assert_eq!(h.platform.events("a").len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_vanished_records() {
        let h = Harness::new();
        h.source.set_records(vec![
            event("e1", "l1", hours(&[10])),
            event("e2", "l1", hours(&[10])),
        ]);
        h.run().await;

        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);
        let stats = h.run().await;
        assert_eq!(scope(&stats).removed_events, 1);
        assert!(!h.store.has_sync_records("a", "e2.l1").unwrap());
        assert!(h.store.has_sync_records("a", "e1.l1").unwrap());
        assert_eq!(h.platform.events("a").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_update_is_protected_from_sweep() {
        let h = Harness::new();
        h.source.set_records(vec![
            event("e1", "l1", hours(&[10])),
            event("e2", "l1", hours(&[10])),
        ]);
        h.run().await;

        h.platform.fail_next_update(
            RemoteError::new(RemoteErrorKind::Server, "bad gateway").with_status(502),
        );
        h.source.set_records(vec![event("e1", "l1", hours(&[10, 11]))]);
        let stats = h.run().await;

        assert_eq!(scope(&stats).remote_request_errors, 1);
        assert_eq!(scope(&stats).removed_events, 1);
        assert!(h.store.has_sync_records("a", "e1.l1").unwrap());
        assert!(!h.store.has_sync_records("a", "e2.l1").unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_slug_on_new_chunk_is_retried() {
        let h = Harness::new();
        let options = RunOptions {
            chunk_capacity: 1,
            ..h.options()
        };
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);
        h.run_with(options.clone()).await;

        h.platform.fail_next_create(
            RemoteError::new(RemoteErrorKind::DuplicateSlug, "duplicate slug").with_status(400),
        );
        h.source.set_records(vec![event("e1", "l1", hours(&[10, 11]))]);
        let stats = h.run_with(options).await;

        assert_eq!(scope(&stats).updated_events, 1);
        assert_eq!(scope(&stats).created_events, 1);
        assert!(scope(&stats).errors.is_empty());
        assert_eq!(scope(&stats).remote_request_errors, 0);
        let records = h.store.find_sync_records("a", "e1.l1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].chunk_index, 1);
        let slug = records[1].target_data.slug.as_deref().unwrap();
        assert!(slug.starts_with("e1_"), "{slug}");
    }

    #[tokio::test]
    async fn test_not_found_on_update_recreates() {
        let h = Harness::new();
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);
        h.run().await;
        let before = h.store.find_sync_records("a", "e1.l1").unwrap();
        h.platform.remove_event("a", &before[0].target_id);

        h.source.set_records(vec![event("e1", "l1", hours(&[10, 11]))]);
        let stats = h.run().await;

        assert_eq!(scope(&stats).recreated_events, 1);
        let after = h.store.find_sync_records("a", "e1.l1").unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].chunk_index, 0);
        assert_ne!(after[0].target_id, before[0].target_id);
    }

    #[tokio::test]
    async fn test_null_post_map_on_update_removes_event() {
        let h = Harness::new();
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);
        h.run().await;

        h.source.drop_on_update("e1");
        let stats = h
            .run_with(RunOptions {
                force_update: true,
                ..h.options()
            })
            .await;
        assert_eq!(scope(&stats).removed_falsy_events, 1);
        assert_eq!(h.store.count_sync_records().unwrap(), 0);
        assert!(h.platform.events("a").is_empty());
    }

    #[tokio::test]
    async fn test_flat_timings_expand_before_guard() {
        let h = Harness::new();
        let flat = json!([{"begin": "2024-05-01T10:00:00Z", "end": "2024-05-01T10:00:00Z"}]);
        h.source.set_records(vec![event("e1", "l1", flat)]);

        let stats = h.run().await;
        assert_eq!(scope(&stats).created_events, 0);
        assert_eq!(scope(&stats).source_errors.missing_timings, vec!["e1"]);
        assert_eq!(scope(&stats).error_count(ErrorKey::EventMapErrors), 1);

        let stats = h
            .run_with(RunOptions {
                flat_timing_duration_secs: Some(3600),
                ..h.options()
            })
            .await;
        assert_eq!(scope(&stats).created_events, 1);
        let created = h.platform.created_events();
        assert!(created[0].timings[0].is_valid());
    }

    #[tokio::test]
    async fn test_simulate_mutates_nothing() {
        let h = Harness::new();
        h.source.set_records(vec![
            event("e1", "l1", hours(&[10])),
            event("e2", "l1", hours(&[10])),
        ]);
        h.run().await;
        let calls = h.platform.calls().len();

        h.source.set_records(vec![
            event("e1", "l1", hours(&[10, 11])),
            event("e3", "l2", hours(&[10])),
        ]);
        let stats = h
            .run_with(RunOptions {
                simulate: true,
                ..h.options()
            })
            .await;

        assert_eq!(scope(&stats).updated_events, 1);
        assert_eq!(scope(&stats).created_events, 1);
        assert_eq!(scope(&stats).removed_events, 1);
        assert_eq!(h.store.count_sync_records().unwrap(), 2);
        assert!(h.store.has_sync_records("a", "e2.l1").unwrap());
        assert!(h.store.find_location("a", "l2").unwrap().is_none());

        let mutations = h.platform.calls()[calls..]
            .iter()
            .filter(|call| !matches!(call.as_str(), "fetch_schema" | "list_locations"))
            .count();
        assert_eq!(mutations, 0);
    }

    #[tokio::test]
    async fn test_interrupted_run_is_resumed() {
        let h = Harness::new();
        let queue = StagingQueue::open(h.dir.path()).await.unwrap();
        queue.stage(0, &event("e1", "l1", hours(&[10]))).await.unwrap();
        h.source.set_records(vec![
            event("e1", "l1", hours(&[10])),
            event("e2", "l1", hours(&[10])),
        ]);

        let stats = h.run().await;
        assert!(stats.resumed);
        assert_eq!(scope(&stats).created_events, 2);
        assert_eq!(scope(&stats).up_to_date_events, 1);
        assert_eq!(h.platform.calls_named("create_event"), 2);
        assert!(!queue.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_source_failure_skips_sweep() {
        let h = Harness::new();
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);
        h.run().await;

        h.source.fail_listing(true);
        let stats = h.run().await;
        assert!(stats.source_error.is_some());
        assert!(!stats.swept);
        assert_eq!(h.store.count_sync_records().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_sweep() {
        let h = Harness::new();
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);
        h.run().await;

        h.source.set_records(Vec::new());
        h.engine.cancel_token().cancel();
        let stats = h.run().await;
        assert!(stats.cancelled);
        assert!(!stats.swept);
        assert_eq!(h.store.count_sync_records().unwrap(), 1);

        h.engine.cancel_token().reset();
        let stats = h.run().await;
        assert!(stats.swept);
        assert_eq!(h.store.count_sync_records().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_download_only_stages_records() {
        let h = Harness::new();
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);

        let stats = h
            .run_with(RunOptions {
                download_only: true,
                ..h.options()
            })
            .await;
        assert_eq!(stats.downloaded_records, 1);
        assert!(stats.scopes.is_empty());
        let queue = StagingQueue::open(h.dir.path()).await.unwrap();
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_download_only_leaves_pending_records_alone() {
        let h = Harness::new();
        let queue = StagingQueue::open(h.dir.path()).await.unwrap();
        queue.stage(0, &event("e9", "l1", hours(&[10]))).await.unwrap();
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);

        let stats = h
            .run_with(RunOptions {
                download_only: true,
                ..h.options()
            })
            .await;
        assert!(!stats.resumed);
        assert!(stats.scopes.is_empty());
        assert!(h.platform.calls().is_empty());
        assert_eq!(h.store.count_sync_records().unwrap(), 0);

        let pending = queue.pending().await.unwrap();
        let indexes: Vec<u64> = pending.iter().map(|f| f.index).collect();
        assert_eq!(indexes, vec![0, 1]);
        assert_eq!(queue.read(&pending[0]).await.unwrap()["id"], "e9");
        assert_eq!(queue.read(&pending[1]).await.unwrap()["id"], "e1");

        let stats = h.run().await;
        assert!(stats.resumed);
        assert_eq!(scope(&stats).created_events, 2);
        assert!(!queue.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_newer_source_date_forces_update() {
        let h = Harness::new();
        h.source.set_records(vec![event("e1", "l1", hours(&[10]))]);
        h.run().await;

        let newer = updated_at(
            event("e1", "l1", hours(&[10])),
            Some("2999-01-01T00:00:00Z".to_string()),
        );
        h.source.set_records(vec![newer]);
        let stats = h.run().await;
        assert_eq!(scope(&stats).updated_events, 1);
        assert_eq!(scope(&stats).up_to_date_events, 0);
        assert_eq!(h.platform.calls_named("update_event"), 1);
    }

    #[tokio::test]
    async fn test_missing_source_date_counts_as_changed() {
        let h = Harness::new();
        h.source
            .set_records(vec![updated_at(event("e1", "l1", hours(&[10])), None)]);
        let first = h.run().await;
        assert_eq!(scope(&first).created_events, 1);

        let second = h.run().await;
        assert_eq!(scope(&second).updated_events, 1);
        assert_eq!(scope(&second).up_to_date_events, 0);
    }

    #[tokio::test]
    async fn test_staleness_tolerance_widens_the_window() {
        let h = Harness::new();
        let hour_ago = (Utc::now() - chrono::Duration::hours(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        h.source.set_records(vec![updated_at(
            event("e1", "l1", hours(&[10])),
            Some(hour_ago),
        )]);
        h.run().await;

        let strict = h.run().await;
        assert_eq!(scope(&strict).up_to_date_events, 1);
        assert_eq!(scope(&strict).updated_events, 0);

        let tolerant = h
            .run_with(RunOptions {
                staleness_tolerance_secs: 2 * 3600,
                ..h.options()
            })
            .await;
        assert_eq!(scope(&tolerant).updated_events, 1);
        assert_eq!(scope(&tolerant).up_to_date_events, 0);
    }

    #[tokio::test]
    async fn test_open_creates_database_under_working_dir() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::open(
            Arc::new(MockSource::new()),
            Arc::new(MockPlatform::new()),
            dir.path(),
        )
        .unwrap();
        assert_eq!(engine.store().count_sync_records().unwrap(), 0);
        assert!(database_path(dir.path()).exists());
    }
}
