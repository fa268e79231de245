//! Detect Engine
//!
//! Process-scoped owner of the generation registry, the generation builder,
//! the dispatch table and the worker-thread registry. Startup builds and
//! publishes the first generation, workers are spawned bound to whatever is
//! active, and `reload` runs the full build / publish / swap / retire cycle
//! through the [`ReloadSyncer`].

use crate::config::{ConfigSource, ConfigStore, ConfigView, PrefixGuard, ReloadConfig};
use crate::dispatch::DispatchTable;
use crate::error::{DetectError, Result};
use crate::generation::{Generation, GenerationBuilder, GenerationId, RuleSource};
use crate::keyword::{KeywordId, KeywordInit, KeywordMode, KeywordTeardown};
use crate::registry::GenerationRegistry;
use crate::swap::{SwapOrchestrator, SwapReport};
use crate::sync::{ReloadSyncer, SyncState};
use crate::threads::{
    detect_slot, DetectEvent, DetectWorker, StageDescriptor, StageKind, ThreadRegistry, WorkerThread,
};
use crate::worker::WorkerState;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use sase_ips::RuleCompiler;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Root of the per-reload configuration namespaces
pub const RELOAD_PREFIX_ROOT: &str = "detect-engine-reloads";

/// Engine status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub active: Option<GenerationId>,
    pub live: Vec<GenerationId>,
    pub retired: Vec<GenerationId>,
    pub signatures: usize,
    pub minimal: bool,
    pub workers: usize,
    pub inspection_workers: usize,
    pub sync_state: SyncState,
    pub last_error: Option<String>,
    pub last_reload: Option<SwapReport>,
}

/// The detection engine
pub struct DetectEngine {
    config: Arc<ConfigStore>,
    reload_config: ReloadConfig,
    registry: Arc<GenerationRegistry>,
    builder: GenerationBuilder,
    dispatch: Arc<DispatchTable>,
    threads: Arc<ThreadRegistry>,
    syncer: Arc<ReloadSyncer>,
    rules: Arc<dyn RuleSource>,
    shutdown: Arc<AtomicBool>,
    watcher_running: Arc<AtomicBool>,
    events: (Sender<DetectEvent>, Receiver<DetectEvent>),
    reload_seq: AtomicU64,
    /// Serializes reloads against each other and against worker spawns
    reload_lock: Mutex<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    last_report: Mutex<Option<SwapReport>>,
}

impl DetectEngine {
    /// Engine using the bundled rule compiler
    pub fn new(config: Arc<ConfigStore>, rules: Arc<dyn RuleSource>, dispatch: DispatchTable) -> Result<Self> {
        let builder = GenerationBuilder::new(Arc::new(RuleCompiler::default()));
        Self::with_builder(config, rules, dispatch, builder)
    }

    pub fn with_builder(
        config: Arc<ConfigStore>,
        rules: Arc<dyn RuleSource>,
        dispatch: DispatchTable,
        builder: GenerationBuilder,
    ) -> Result<Self> {
        let reload_config = ReloadConfig::from_source(&*config)?;
        let events = bounded(reload_config.queue_depth.max(1));
        Ok(Self {
            config,
            reload_config,
            registry: Arc::new(GenerationRegistry::new()),
            builder,
            dispatch: Arc::new(dispatch),
            threads: Arc::new(ThreadRegistry::new()),
            syncer: Arc::new(ReloadSyncer::new()),
            rules,
            shutdown: Arc::new(AtomicBool::new(false)),
            watcher_running: Arc::new(AtomicBool::new(false)),
            events,
            reload_seq: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
            handles: Mutex::new(Vec::new()),
            last_report: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GenerationRegistry> {
        &self.registry
    }

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    pub fn syncer(&self) -> &Arc<ReloadSyncer> {
        &self.syncer
    }

    pub fn reload_config(&self) -> &ReloadConfig {
        &self.reload_config
    }

    /// Matches reported by the workers
    pub fn events(&self) -> Receiver<DetectEvent> {
        self.events.1.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Register a keyword context for every generation built from now on
    pub fn register_keyword(
        &self,
        name: &str,
        init: KeywordInit,
        teardown: KeywordTeardown,
        mode: KeywordMode,
    ) -> KeywordId {
        self.builder.register_keyword(name, init, teardown, mode)
    }

    fn detection_enabled(config: &dyn ConfigSource) -> bool {
        config.get_bool("detect-engine.enabled").unwrap_or(true)
    }

    /// Build and publish the first generation
    pub fn init(&self) -> Result<GenerationId> {
        let _reload = self.reload_lock.lock();
        if let Some(active) = self.registry.active_id() {
            return Ok(active);
        }

        let generation = if Self::detection_enabled(&*self.config) {
            let rule_text = self.rules.load(&*self.config)?;
            self.builder.build(&*self.config, &rule_text)?
        } else {
            tracing::info!("Detection disabled, using minimal generation");
            self.builder.build_minimal()
        };
        let id = generation.id();
        self.registry.publish(Arc::new(generation))?;
        tracing::info!(generation = %id, "Detection engine initialized");
        Ok(id)
    }

    /// Start a detect worker bound to the active generation
    pub fn spawn_worker(&self, name: &str) -> Result<Arc<WorkerThread>> {
        let _reload = self.reload_lock.lock();
        if self.is_shutting_down() {
            return Err(DetectError::Aborted("engine is shutting down".into()));
        }
        let current = self.registry.current().ok_or(DetectError::NotInitialized)?;

        let id = self.threads.next_id();
        let state = WorkerState::adopt(current.arc(), id)?;
        drop(current);

        let (tx, rx) = bounded(self.reload_config.queue_depth.max(1));
        let (slot, port) = detect_slot();
        let thread = self.threads.register(WorkerThread::new(
            id,
            name,
            vec![
                StageDescriptor::new("decode", StageKind::Decode),
                StageDescriptor::new("detect", StageKind::Detect),
            ],
            tx,
            Some(slot),
        ));

        let worker = DetectWorker::new(
            thread.clone(),
            rx,
            port,
            Box::new(state),
            self.dispatch.clone(),
            Some(self.events.0.clone()),
            self.shutdown.clone(),
            self.reload_config.poll_interval(),
        );
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.threads.unregister(id);
                DetectError::SpawnFailed(e.to_string())
            })?;
        self.handles.lock().push(handle);

        tracing::info!(worker = id, name, "Spawned detect worker");
        Ok(thread)
    }

    /// Reload the ruleset. With `config_path`, the file is loaded under a
    /// fresh `detect-engine-reloads.<n>` prefix and the new generation reads
    /// its detect-engine settings from there.
    pub fn reload(&self, config_path: Option<&Path>) -> Result<SwapReport> {
        let _reload = self.reload_lock.lock();
        self.syncer.request_reload()?;
        // Nobody else can start while the reload lock is held
        self.syncer.start();

        let result = self.run_reload(config_path);
        self.syncer.set_done(result.as_ref().err().map(|e| e.to_string()));
        result
    }

    /// Perform a reload requested through the syncer, if any
    pub fn service_reload_request(&self) -> bool {
        let _reload = self.reload_lock.lock();
        if !self.syncer.start() {
            return false;
        }
        let result = self.run_reload(None);
        self.syncer.set_done(result.err().map(|e| e.to_string()));
        true
    }

    /// Ask the reload watcher for a reload without waiting for it
    pub fn request_reload(&self) -> Result<()> {
        if !self.has_reload_watcher() {
            return Err(DetectError::NoReloadWatcher);
        }
        self.syncer.request_reload()
    }

    pub fn has_reload_watcher(&self) -> bool {
        self.watcher_running.load(Ordering::Acquire)
    }

    /// Control thread servicing [`ReloadSyncer::request_reload`] triggers.
    /// A second call while a watcher runs is a no-op.
    pub fn spawn_reload_watcher(self: &Arc<Self>) -> Result<()> {
        if self.watcher_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let engine: Weak<Self> = Arc::downgrade(self);
        let running = self.watcher_running.clone();
        let shutdown = self.shutdown.clone();
        let syncer = self.syncer.clone();
        let poll = self.reload_config.poll_interval();

        let handle = std::thread::Builder::new()
            .name("detect-reload".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    if !syncer.wait_requested(poll) {
                        continue;
                    }
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    engine.service_reload_request();
                }
                running.store(false, Ordering::Release);
                tracing::debug!("Reload watcher stopped");
            })
            .map_err(|e| {
                self.watcher_running.store(false, Ordering::Release);
                DetectError::SpawnFailed(e.to_string())
            })?;
        self.handles.lock().push(handle);
        Ok(())
    }

    fn run_reload(&self, config_path: Option<&Path>) -> Result<SwapReport> {
        if self.registry.active_id().is_none() {
            return Err(DetectError::NotInitialized);
        }

        let guard = match config_path {
            Some(path) => {
                let prefix = format!(
                    "{}.{}",
                    RELOAD_PREFIX_ROOT,
                    self.reload_seq.fetch_add(1, Ordering::Relaxed) + 1
                );
                self.config.load_file_with_prefix(path, &prefix)?;
                tracing::info!(path = %path.display(), prefix = %prefix, "Loaded reload configuration");
                Some(PrefixGuard::new(self.config.clone(), prefix))
            }
            None => None,
        };

        let generation = self.build_generation(guard).map_err(|e| {
            tracing::error!(error = %e, "Failed to build new detection generation");
            e
        })?;

        let report = SwapOrchestrator::new(
            self.registry.clone(),
            self.threads.clone(),
            self.reload_config.clone(),
            self.shutdown.clone(),
        )
        .swap(generation)?;

        if !report.is_complete() {
            tracing::warn!(
                swapped = report.swapped,
                workers = report.workers,
                "Not all workers moved to the new generation"
            );
        }
        *self.last_report.lock() = Some(report.clone());
        Ok(report)
    }

    fn build_generation(&self, guard: Option<PrefixGuard>) -> Result<Generation> {
        let rule_text = {
            let view = ConfigView::new(&*self.config, guard.as_ref().map(|g| g.prefix()));
            if !Self::detection_enabled(&view) {
                None
            } else if view.get_subtree("rule-files").is_some() {
                Some(self.rules.load(&view)?)
            } else {
                Some(self.rules.load(&*self.config)?)
            }
        };

        match rule_text {
            Some(text) => self.builder.build_with_prefix(&*self.config, guard, &text),
            None => Ok(self.builder.build_minimal()),
        }
    }

    pub fn status(&self) -> EngineStatus {
        let current = self.registry.current();
        EngineStatus {
            active: current.as_ref().map(|g| g.id()),
            live: self.registry.live_ids(),
            retired: self.registry.retired_ids(),
            signatures: current.as_ref().map_or(0, |g| g.signature_count()),
            minimal: current.as_ref().map_or(false, |g| g.is_minimal()),
            workers: self.threads.len(),
            inspection_workers: self.threads.inspection_workers().len(),
            sync_state: self.syncer.state(),
            last_error: self.syncer.last_error(),
            last_reload: self.last_report.lock().clone(),
        }
    }

    /// Stop every worker and the reload watcher, then drain the registry.
    /// Returns generations that were still referenced.
    pub fn shutdown(&self) -> Vec<GenerationId> {
        self.shutdown.store(true, Ordering::Relaxed);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Engine thread panicked");
            }
        }

        let _reload = self.reload_lock.lock();
        for worker in self.threads.snapshot() {
            self.threads.unregister(worker.id());
        }
        let busy = self.registry.drain();
        tracing::info!(busy = ?busy, "Detection engine stopped");
        busy
    }
}

impl Drop for DetectEngine {
    fn drop(&mut self) {
        // Detached threads notice the flag and exit on their own
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Direction, DispatchTableBuilder};
    use crate::generation::StaticRules;
    use crate::inspect::Record;
    use crate::keyword::KeywordContext;
    use bytes::Bytes;
    use sase_ips::{AppProto, SigList, TransportClass};
    use std::io::Write;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    const RULES: &str = r#"
        alert http any any -> any any (msg:"admin"; content:"/admin"; http_uri; sid:10;)
        alert tcp any any -> any any (msg:"marker"; content:"needle"; sid:11;)
    "#;

    const CONFIG: &str = r#"
detect-engine:
  profile: low
  reload:
    poll-interval-ms: 2
    adoption-timeout-ms: 2000
    queue-depth: 64
"#;

    /// Rules that can be swapped between reloads
    struct SharedRules(Mutex<String>);

    impl RuleSource for SharedRules {
        fn load(&self, _config: &dyn ConfigSource) -> Result<String> {
            Ok(self.0.lock().clone())
        }
    }

    fn engine_with(rules: Arc<dyn RuleSource>, yaml: &str) -> DetectEngine {
        init_tracing();
        let config = Arc::new(ConfigStore::from_yaml(yaml).unwrap());
        DetectEngine::new(config, rules, DispatchTableBuilder::with_default_engines().build()).unwrap()
    }

    fn needle() -> Record {
        Record::new(
            TransportClass::Tcp,
            AppProto::Unknown,
            Direction::ToServer,
            Bytes::from_static(b"...needle..."),
        )
    }

    #[test]
    fn test_init_and_inspect() {
        let engine = engine_with(Arc::new(StaticRules(RULES.into())), CONFIG);
        let id = engine.init().unwrap();
        assert_eq!(engine.init().unwrap(), id);

        let worker = engine.spawn_worker("W#01").unwrap();
        let events = engine.events();
        assert!(worker.inject(needle()));
        let http = Record::new(TransportClass::Tcp, AppProto::Http, Direction::ToServer, Bytes::new())
            .with_buffer(SigList::Uri, Bytes::from_static(b"/admin"));
        assert!(worker.inject(http));

        let first = events.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.sids, vec![11]);
        assert_eq!(second.sids, vec![10]);
        assert_eq!(first.generation, id);

        assert!(engine.shutdown().is_empty());
        assert!(worker.is_done());
    }

    #[test]
    fn test_spawn_requires_init() {
        let engine = engine_with(Arc::new(StaticRules(RULES.into())), CONFIG);
        assert!(matches!(engine.spawn_worker("W#01"), Err(DetectError::NotInitialized)));
        assert!(matches!(engine.reload(None), Err(DetectError::NotInitialized)));
        // The failed reload still returns the syncer to idle
        assert_eq!(engine.syncer().state(), SyncState::Idle);
    }

    #[test]
    fn test_reload_swaps_workers() {
        let rules = Arc::new(SharedRules(Mutex::new(RULES.to_string())));
        let engine = engine_with(rules.clone(), CONFIG);
        let g1 = engine.init().unwrap();
        let workers: Vec<_> = (1..=3)
            .map(|i| engine.spawn_worker(&format!("W#{:02}", i)).unwrap())
            .collect();

        *rules.0.lock() = r#"alert tcp any any -> any any (content:"needle"; sid:99;)"#.to_string();
        let report = engine.reload(None).unwrap();

        assert_eq!(report.previous, Some(g1));
        assert_eq!(report.workers, 3);
        assert!(report.is_complete());
        assert_eq!(report.reclaimed, vec![g1]);

        let status = engine.status();
        assert_eq!(status.active, Some(report.active));
        assert_eq!(status.live, vec![report.active]);
        assert!(status.retired.is_empty());
        assert_eq!(status.signatures, 1);
        assert_eq!(status.sync_state, SyncState::Idle);

        let events = engine.events();
        assert!(workers[0].inject(needle()));
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.generation, report.active);
        assert_eq!(event.sids, vec![99]);

        assert!(engine.shutdown().is_empty());
    }

    #[test]
    fn test_failed_reload_keeps_active_generation() {
        let rules = Arc::new(SharedRules(Mutex::new(RULES.to_string())));
        let engine = engine_with(rules.clone(), CONFIG);
        let g1 = engine.init().unwrap();
        let worker = engine.spawn_worker("W#01").unwrap();

        *rules.0.lock() = "this is not a rule".to_string();
        let result = engine.reload(None);
        assert!(matches!(result, Err(DetectError::Compile(_))));

        let status = engine.status();
        assert_eq!(status.active, Some(g1));
        assert_eq!(status.live, vec![g1]);
        assert!(status.last_error.is_some());
        assert!(status.last_reload.is_none());

        let events = engine.events();
        assert!(worker.inject(needle()));
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.generation, g1);

        engine.shutdown();
    }

    #[test]
    fn test_reload_with_prefixed_config() {
        let engine = engine_with(Arc::new(StaticRules(RULES.into())), CONFIG);
        let g1 = engine.init().unwrap();

        let mut file = std::env::temp_dir();
        file.push(format!("sase-detect-reload-{}.yaml", std::process::id()));
        {
            let mut f = std::fs::File::create(&file).unwrap();
            writeln!(f, "detect-engine:\n  profile: high").unwrap();
        }

        let report = engine.reload(Some(&file)).unwrap();
        let current = engine.registry().current().unwrap();
        assert_eq!(current.id(), report.active);
        assert_eq!(current.config_prefix(), Some("detect-engine-reloads.1"));
        assert_eq!(
            current.settings().limits,
            crate::generation::GroupingLimits::HIGH
        );
        assert!(engine.config().has_prefix("detect-engine-reloads.1"));
        assert_eq!(report.reclaimed, vec![g1]);
        drop(current);

        // Superseding the prefixed generation drops its namespace
        engine.reload(None).unwrap();
        assert!(!engine.config().has_prefix("detect-engine-reloads.1"));

        // A prefix that is already present fails the reload
        engine
            .config()
            .load_str_with_prefix("x: 1", "detect-engine-reloads.2")
            .unwrap();
        assert!(matches!(engine.reload(Some(&file)), Err(DetectError::PrefixExists(_))));
        assert!(engine.config().has_prefix("detect-engine-reloads.2"));

        let _ = std::fs::remove_file(&file);
        engine.shutdown();
    }

    #[test]
    fn test_disabled_detection_uses_minimal_generation() {
        let engine = engine_with(
            Arc::new(StaticRules(RULES.into())),
            "detect-engine:\n  enabled: no\n",
        );
        engine.init().unwrap();
        let status = engine.status();
        assert!(status.minimal);
        assert_eq!(status.signatures, 0);

        let worker = engine.spawn_worker("W#01").unwrap();
        let events = engine.events();
        assert!(worker.inject(needle()));
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());
        engine.shutdown();
    }

    #[test]
    fn test_watcher_services_requests() {
        let engine = Arc::new(engine_with(Arc::new(StaticRules(RULES.into())), CONFIG));
        let g1 = engine.init().unwrap();
        engine.spawn_worker("W#01").unwrap();
        engine.spawn_reload_watcher().unwrap();

        engine.syncer().trigger_and_wait(Duration::from_secs(5)).unwrap();
        assert_ne!(engine.status().active, Some(g1));
        assert_eq!(engine.syncer().state(), SyncState::Idle);

        engine.shutdown();
    }

    #[test]
    fn test_keyword_contexts_follow_generations() {
        let engine = engine_with(Arc::new(StaticRules(RULES.into())), CONFIG);
        let created = Arc::new(AtomicU64::new(0));
        let freed = Arc::new(AtomicU64::new(0));
        let (c, f) = (created.clone(), freed.clone());
        engine.register_keyword(
            "flowbits",
            Arc::new(move || -> Option<KeywordContext> {
                c.fetch_add(1, Ordering::SeqCst);
                Some(Box::new(0u32))
            }),
            Arc::new(move |_ctx: KeywordContext| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            KeywordMode::Shared,
        );

        engine.init().unwrap();
        engine.spawn_worker("W#01").unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        engine.reload(None).unwrap();
        // Replacement built, old context torn down
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(freed.load(Ordering::SeqCst), 1);

        engine.shutdown();
        assert_eq!(freed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_replacement_aborts_swap() {
        let engine = engine_with(Arc::new(StaticRules(RULES.into())), CONFIG);
        let created = Arc::new(AtomicU64::new(0));
        let freed = Arc::new(AtomicU64::new(0));
        let (c, f) = (created.clone(), freed.clone());
        engine.register_keyword(
            "xbits",
            Arc::new(move || -> Option<KeywordContext> {
                // The second worker's replacement on the first reload fails
                if c.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                    return None;
                }
                Some(Box::new(0u32))
            }),
            Arc::new(move |_ctx: KeywordContext| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            KeywordMode::PerInstance,
        );

        let g1 = engine.init().unwrap();
        engine.spawn_worker("W#01").unwrap();
        engine.spawn_worker("W#02").unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);

        let result = engine.reload(None);
        assert!(matches!(result, Err(DetectError::KeywordInit(ref name)) if name == "xbits"));

        // The replacement already built for W#01 was released
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        let status = engine.status();
        assert_eq!(status.active, Some(g1));
        assert_eq!(status.live, vec![g1]);
        assert!(status.retired.is_empty());
        assert!(status.last_reload.is_none());
        assert_eq!(status.sync_state, SyncState::Idle);

        let report = engine.reload(None).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.previous, Some(g1));
        assert_eq!(freed.load(Ordering::SeqCst), 3);

        assert!(engine.shutdown().is_empty());
        assert_eq!(freed.load(Ordering::SeqCst), 5);
    }
}
