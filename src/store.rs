//! The knowledge store: one user graph plus lazily loaded project graphs.
//!
//! Every graph sits behind its own async mutex, acquired with a bounded
//! wait. The session registry is locked only while a graph lock is held
//! (graph, then registry) and never the other way round. A background
//! maintenance task compacts and saves each graph on a fixed interval.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::archival::{ArchivalConfig, ArchivalController, MaintenanceReport};
use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::graph::{
    EdgeContent, EdgeKey, Graph, GraphStats, GraphView, Level, Node, NodeContent, PutOutcome,
    Scope,
};
use crate::persistence::{GraphFile, LoadReport};
use crate::session::{sync_graph, SessionId, SessionRegistry, SyncResponse};

/// Scope label reported when the project map itself is contended.
const PROJECT_MAP: &str = "projects";

/// Health of one loaded graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeStatus {
    pub scope: Scope,
    pub path: PathBuf,
    #[serde(flatten)]
    pub stats: GraphStats,
    pub load: LoadReport,
    /// Most recent save failure, cleared by the next successful save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_save_error: Option<String>,
}

/// Response to `ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingReport {
    pub active_session_count: usize,
    /// User graph first, then loaded project graphs by key.
    pub scopes: Vec<ScopeStatus>,
}

impl PingReport {
    pub fn scope(&self, scope: &Scope) -> Option<&ScopeStatus> {
        self.scopes.iter().find(|s| &s.scope == scope)
    }
}

/// Mutable state of one graph, guarded by its slot lock.
struct GraphState {
    graph: Graph,
    load: LoadReport,
    last_save_error: Option<String>,
}

/// A graph together with the file it persists to.
struct GraphSlot {
    scope: Scope,
    file: GraphFile,
    state: Mutex<GraphState>,
}

impl GraphSlot {
    fn load(scope: Scope, path: PathBuf, clock: &Clock) -> Self {
        let file = GraphFile::new(path);
        let (snapshot, load) = file.load();
        let graph = match snapshot {
            Some(snapshot) => {
                clock.observe(snapshot.saved_at);
                Graph::from_data(scope.clone(), snapshot.data)
            }
            None => Graph::new(scope.clone()),
        };
        if let Some(latest) = graph.latest_stamp() {
            clock.observe(latest);
        }

        Self {
            scope,
            file,
            state: Mutex::new(GraphState {
                graph,
                load,
                last_save_error: None,
            }),
        }
    }
}

struct Inner {
    config: StoreConfig,
    clock: Clock,
    sessions: SessionRegistry,
    archival: ArchivalController,
    user: Arc<GraphSlot>,
    projects: RwLock<HashMap<String, Arc<GraphSlot>>>,
    shutdown: watch::Sender<bool>,
}

/// Shared handle to the knowledge store. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Open the store, loading the user graph from disk.
    ///
    /// Project graphs are loaded on first use.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let clock = Clock::new();
        let user = GraphSlot::load(Scope::User, config.resolved_user_graph_path(), &clock);
        let (shutdown, _) = watch::channel(false);

        info!(path = %user.file.path().display(), "knowledge store opened");
        Ok(Self {
            inner: Arc::new(Inner {
                archival: ArchivalController::new(ArchivalConfig::from(&config)),
                config,
                clock,
                sessions: SessionRegistry::new(),
                user: Arc::new(user),
                projects: RwLock::new(HashMap::new()),
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    // ==================== Routing & locking ====================

    async fn slot(&self, level: Level, project_key: Option<&str>) -> Result<Arc<GraphSlot>> {
        match Scope::resolve(level, project_key)? {
            Scope::User => Ok(Arc::clone(&self.inner.user)),
            Scope::Project(key) => self.project_slot(key).await,
        }
    }

    async fn project_slot(&self, key: String) -> Result<Arc<GraphSlot>> {
        if let Some(slot) = self.read_projects().await?.get(&key) {
            return Ok(Arc::clone(slot));
        }

        // Disk reads happen outside the map lock.
        let path = self.inner.config.project_graph_path(&key);
        debug!(project = %key, path = %path.display(), "loading project graph");
        let inner = Arc::clone(&self.inner);
        let scope = Scope::Project(key.clone());
        let loaded = tokio::task::spawn_blocking(move || GraphSlot::load(scope, path, &inner.clock))
            .await
            .map_err(|e| Error::Internal(format!("project graph load task failed: {e}")))?;

        // A concurrent first use may have won the race; keep its slot.
        let mut projects = self.write_projects().await?;
        let slot = projects.entry(key).or_insert_with(|| Arc::new(loaded));
        Ok(Arc::clone(slot))
    }

    async fn read_projects(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<GraphSlot>>>> {
        let wait = self.inner.config.lock_timeout();
        tokio::time::timeout(wait, self.inner.projects.read())
            .await
            .map_err(|_| Error::busy(PROJECT_MAP, wait.as_millis() as u64))
    }

    async fn write_projects(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Arc<GraphSlot>>>> {
        let wait = self.inner.config.lock_timeout();
        tokio::time::timeout(wait, self.inner.projects.write())
            .await
            .map_err(|_| Error::busy(PROJECT_MAP, wait.as_millis() as u64))
    }

    async fn lock<'a>(&self, slot: &'a GraphSlot) -> Result<MutexGuard<'a, GraphState>> {
        let wait = self.inner.config.lock_timeout();
        tokio::time::timeout(wait, slot.state.lock())
            .await
            .map_err(|_| Error::busy(&slot.scope, wait.as_millis() as u64))
    }

    /// Every loaded slot, user first.
    async fn slots(&self) -> Result<Vec<Arc<GraphSlot>>> {
        let projects = self.read_projects().await?;
        let mut keys: Vec<&String> = projects.keys().collect();
        keys.sort();

        Ok(std::iter::once(Arc::clone(&self.inner.user))
            .chain(keys.into_iter().map(|k| Arc::clone(&projects[k])))
            .collect())
    }

    /// Refresh `last_seen_at` for a writer. Unknown ids are not an error.
    fn touch_session(&self, session: Option<&SessionId>, now: DateTime<Utc>) -> Result<()> {
        if let Some(id) = session {
            if !self.inner.sessions.touch(id, now)? {
                debug!(session = %id, "write from unregistered session");
            }
        }
        Ok(())
    }

    // ==================== Sessions ====================

    /// Start a new session. Its watermarks begin now.
    pub fn register_session(&self) -> Result<SessionId> {
        self.inner.sessions.register(self.inner.clock.now())
    }

    /// Changes to one graph since the session last synced it.
    pub async fn sync(
        &self,
        level: Level,
        project_key: Option<&str>,
        session: &SessionId,
    ) -> Result<SyncResponse> {
        let slot = self.slot(level, project_key).await?;
        let state = self.lock(&slot).await?;
        sync_graph(&state.graph, &self.inner.sessions, session, &self.inner.clock)
    }

    // ==================== Reads ====================

    /// Active nodes and every edge of one graph.
    pub async fn read(&self, level: Level, project_key: Option<&str>) -> Result<GraphView> {
        let slot = self.slot(level, project_key).await?;
        let state = self.lock(&slot).await?;
        Ok(state.graph.read_active())
    }

    /// Session count and the status of every loaded graph.
    pub async fn ping(&self) -> Result<PingReport> {
        let mut scopes = Vec::new();
        for slot in self.slots().await? {
            let state = self.lock(&slot).await?;
            scopes.push(ScopeStatus {
                scope: slot.scope.clone(),
                path: slot.file.path().to_path_buf(),
                stats: state.graph.stats(),
                load: state.load.clone(),
                last_save_error: state.last_save_error.clone(),
            });
        }

        Ok(PingReport {
            active_session_count: self.inner.sessions.active_count()?,
            scopes,
        })
    }

    // ==================== Writes ====================

    pub async fn put_node(
        &self,
        level: Level,
        project_key: Option<&str>,
        content: NodeContent,
        session: Option<&SessionId>,
    ) -> Result<PutOutcome> {
        let slot = self.slot(level, project_key).await?;
        let mut state = self.lock(&slot).await?;
        let now = self.inner.clock.now();
        let outcome = state.graph.put_node(content, session, now)?;
        self.touch_session(session, now)?;
        Ok(outcome)
    }

    pub async fn put_edge(
        &self,
        level: Level,
        project_key: Option<&str>,
        content: EdgeContent,
        session: Option<&SessionId>,
    ) -> Result<PutOutcome> {
        let slot = self.slot(level, project_key).await?;
        let mut state = self.lock(&slot).await?;
        let now = self.inner.clock.now();
        let outcome = state.graph.put_edge(content, session, now)?;
        self.touch_session(session, now)?;
        Ok(outcome)
    }

    /// Delete a node and its edges. Returns the number of edges removed.
    pub async fn delete_node(&self, level: Level, project_key: Option<&str>, id: &str) -> Result<usize> {
        let slot = self.slot(level, project_key).await?;
        let mut state = self.lock(&slot).await?;
        let now = self.inner.clock.now();
        state.graph.delete_node(id, None, now)
    }

    pub async fn delete_edge(
        &self,
        level: Level,
        project_key: Option<&str>,
        from: &str,
        to: &str,
        rel: &str,
    ) -> Result<()> {
        let key = EdgeKey::new(from, to, rel);
        key.validate()?;
        let slot = self.slot(level, project_key).await?;
        let mut state = self.lock(&slot).await?;
        let now = self.inner.clock.now();
        state.graph.delete_edge(&key, None, now)
    }

    /// Reactivate an archived node and return it.
    pub async fn recall(&self, level: Level, project_key: Option<&str>, id: &str) -> Result<Node> {
        let slot = self.slot(level, project_key).await?;
        let mut state = self.lock(&slot).await?;
        let now = self.inner.clock.now();
        state.graph.recall(id, None, now)
    }

    // ==================== Maintenance ====================

    /// Run a maintenance pass on one graph now.
    pub async fn compact(&self, level: Level, project_key: Option<&str>) -> Result<MaintenanceReport> {
        let slot = self.slot(level, project_key).await?;
        let mut state = self.lock(&slot).await?;
        let now = self.inner.clock.now();
        Ok(self.inner.archival.run(&mut state.graph, now))
    }

    /// Save every dirty graph.
    ///
    /// All graphs are attempted; the first failure is returned.
    pub async fn flush(&self) -> Result<()> {
        let mut first_error = None;
        for slot in self.slots().await? {
            let result = match self.lock(&slot).await {
                Ok(mut state) => self.save(&slot, &mut state).map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop background maintenance and flush every dirty graph.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down knowledge store");
        self.inner.shutdown.send_replace(true);
        self.flush().await
    }

    /// One maintenance tick: purge idle sessions, then compact and save each graph.
    ///
    /// Failures are logged per graph and never abort the tick.
    pub async fn run_maintenance(&self) {
        let ttl = self.inner.config.session_ttl();
        match self.inner.sessions.purge_idle(self.inner.clock.now(), ttl) {
            Ok(purged) if !purged.is_empty() => {
                info!(purged = purged.len(), "purged idle sessions");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "session purge failed"),
        }

        let slots = match self.slots().await {
            Ok(slots) => slots,
            Err(e) => {
                warn!(error = %e, "skipping maintenance tick");
                return;
            }
        };
        for slot in slots {
            let mut state = match self.lock(&slot).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(scope = %slot.scope, error = %e, "skipping maintenance for busy graph");
                    continue;
                }
            };
            let now = self.inner.clock.now();
            let report = self.inner.archival.run(&mut state.graph, now);
            if !report.compaction.archived.is_empty() || !report.orphans.reclaimed_nodes.is_empty() {
                debug!(
                    scope = %slot.scope,
                    archived = report.compaction.archived.len(),
                    reclaimed = report.orphans.reclaimed_nodes.len(),
                    "maintenance pass"
                );
            }
            // A failed save is already recorded in the scope status.
            if let Err(e) = self.save(&slot, &mut state) {
                debug!(scope = %slot.scope, error = %e, "save retried next tick");
            }
        }
    }

    /// Persist a dirty graph. Returns whether a write happened.
    fn save(&self, slot: &GraphSlot, state: &mut GraphState) -> Result<bool> {
        if !state.graph.is_dirty() {
            return Ok(false);
        }

        let seq = state.graph.mutation_seq();
        let data = state.graph.to_data();
        let now = self.inner.clock.now();

        match slot.file.save(&data, now) {
            Ok(()) => {
                state.graph.mark_saved(seq, now);
                state.last_save_error = None;
                debug!(scope = %slot.scope, path = %slot.file.path().display(), "saved graph");
                Ok(true)
            }
            Err(e) => {
                error!(scope = %slot.scope, error = %e, "failed to save graph");
                state.last_save_error = Some(e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(feature = "tokio-runtime")]
mod background {
    use super::*;
    use tokio::task::JoinHandle;
    use tokio::time::{interval_at, Instant, MissedTickBehavior};

    /// Handle to the background maintenance task.
    pub struct MaintenanceHandle {
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    impl MaintenanceHandle {
        /// Stop the task and wait for an in-flight tick to finish.
        pub async fn stop(self) {
            self.stop.send_replace(true);
            if let Err(e) = self.task.await {
                error!(error = %e, "maintenance task failed");
            }
        }

        pub fn is_finished(&self) -> bool {
            self.task.is_finished()
        }
    }

    impl Store {
        /// Spawn the autosave loop on the current tokio runtime.
        ///
        /// The first tick fires one `save_interval` from now. The loop ends on
        /// [`MaintenanceHandle::stop`] or [`Store::shutdown`].
        pub fn spawn_maintenance(&self) -> MaintenanceHandle {
            let store = self.clone();
            let period = self.inner.config.save_interval();
            let (stop, mut stop_rx) = watch::channel(false);
            let mut shutdown_rx = self.inner.shutdown.subscribe();

            let task = tokio::spawn(async move {
                if *shutdown_rx.borrow_and_update() {
                    return;
                }
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                debug!(interval_secs = period.as_secs(), "maintenance loop started");

                loop {
                    tokio::select! {
                        _ = ticker.tick() => store.run_maintenance().await,
                        _ = stop_rx.changed() => break,
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!("maintenance loop stopped");
            });

            MaintenanceHandle { stop, task }
        }
    }
}

#[cfg(feature = "tokio-runtime")]
pub use background::MaintenanceHandle;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TombstoneKind;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn config(dir: &Path) -> StoreConfig {
        StoreConfig::default()
            .with_user_graph_path(dir.join("user.json"))
            .with_lock_timeout_ms(50)
    }

    fn open(dir: &Path) -> Store {
        Store::open(config(dir)).unwrap()
    }

    fn project(dir: &Path, name: &str) -> String {
        dir.join(name).to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_put_read_and_versions() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());

        let created = store
            .put_node(Level::User, None, NodeContent::new("auth", "v1"), None)
            .await
            .unwrap();
        let updated = store
            .put_node(Level::User, None, NodeContent::new("auth", "v2"), None)
            .await
            .unwrap();
        assert_eq!(created, PutOutcome::Created);
        assert_eq!(updated, PutOutcome::Updated);

        let view = store.read(Level::User, None).await.unwrap();
        assert_eq!(view.nodes.len(), 1);
        assert_eq!(view.nodes[0].gist, "v2");
        assert_eq!(view.nodes[0].version, 2);
    }

    #[tokio::test]
    async fn test_level_validation() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());

        let err = store.read(Level::User, Some("/work/app")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = store.read(Level::Project, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = store
            .put_node(Level::User, None, NodeContent::new("  ", "blank"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_not_found_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());

        let err = store.recall(Level::User, None, "ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        let err = store.delete_edge(Level::User, None, "a", "b", "r").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let ping = store.ping().await.unwrap();
        assert!(!ping.scopes[0].stats.dirty);
    }

    #[tokio::test]
    async fn test_project_graphs_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let app = project(dir.path(), "app");

        store
            .put_node(Level::Project, Some(&app), NodeContent::new("db", "postgres"), None)
            .await
            .unwrap();

        assert!(store.read(Level::User, None).await.unwrap().nodes.is_empty());
        assert_eq!(store.read(Level::Project, Some(&app)).await.unwrap().nodes.len(), 1);

        let ping = store.ping().await.unwrap();
        assert_eq!(ping.scopes.len(), 2);
        let status = ping.scope(&Scope::Project(app.clone())).unwrap();
        assert_eq!(status.stats.active_node_count, 1);
        assert_eq!(status.path, Path::new(&app).join(".knowledge/graph.json"));
    }

    #[tokio::test]
    async fn test_sync_through_store() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let a = store.register_session().unwrap();
        let b = store.register_session().unwrap();

        store
            .put_node(Level::User, None, NodeContent::new("x", "from a"), Some(&a))
            .await
            .unwrap();
        store
            .put_edge(Level::User, None, EdgeContent::new("x", "src/lib.rs", "in"), Some(&a))
            .await
            .unwrap();

        let diff = store.sync(Level::User, None, &b).await.unwrap();
        assert_eq!(diff.changes.nodes.len(), 1);
        assert_eq!(diff.changes.edges.len(), 1);
        assert!(store.sync(Level::User, None, &a).await.unwrap().changes.is_empty());
        assert!(store.sync(Level::User, None, &b).await.unwrap().changes.is_empty());

        store.delete_node(Level::User, None, "x").await.unwrap();
        let diff = store.sync(Level::User, None, &b).await.unwrap();
        let kinds: Vec<_> = diff.changes.tombstones.iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, vec![TombstoneKind::Edge, TombstoneKind::Node]);

        let err = store
            .sync(Level::User, None, &SessionId::from("expired"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSession(_)));
        assert_eq!(store.ping().await.unwrap().active_session_count, 2);
    }

    #[tokio::test]
    async fn test_lock_timeout_is_busy() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());

        let slot = store.slot(Level::User, None).await.unwrap();
        let _held = slot.state.lock().await;

        let err = store.read(Level::User, None).await.unwrap_err();
        assert!(matches!(err, Error::Busy { waited_ms: 50, .. }));
    }

    #[tokio::test]
    async fn test_project_write_while_user_locked() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let app = project(dir.path(), "app");

        let user = store.slot(Level::User, None).await.unwrap();
        let _held = user.state.lock().await;

        store
            .put_node(Level::Project, Some(&app), NodeContent::new("db", "postgres"), None)
            .await
            .unwrap();
        let err = store.read(Level::User, None).await.unwrap_err();
        assert!(matches!(err, Error::Busy { .. }));
    }

    #[tokio::test]
    async fn test_project_map_wait_is_bounded() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let app = project(dir.path(), "app");

        let held = store.inner.projects.write().await;
        let err = store.read(Level::Project, Some(&app)).await.unwrap_err();
        assert!(matches!(err, Error::Busy { waited_ms: 50, ref scope } if scope == "projects"));
        assert!(matches!(store.ping().await.unwrap_err(), Error::Busy { .. }));
        // The user graph never touches the project map.
        store
            .put_node(Level::User, None, NodeContent::new("u", "still writable"), None)
            .await
            .unwrap();

        drop(held);
        assert!(store.read(Level::Project, Some(&app)).await.unwrap().nodes.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_shares_one_slot() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let app = project(dir.path(), "app");

        let (a, b) = tokio::join!(
            store.slot(Level::Project, Some(&app)),
            store.slot(Level::Project, Some(&app)),
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(store.ping().await.unwrap().scopes.len(), 2);
    }

    #[tokio::test]
    async fn test_project_key_spellings_share_one_graph() {
        let dir = TempDir::new().unwrap();
        let app = project(dir.path(), "app");
        {
            let store = open(dir.path());
            store
                .put_node(Level::Project, Some(&app), NodeContent::new("one", "first"), None)
                .await
                .unwrap();
            store
                .put_node(Level::Project, Some(&format!("{app}/")), NodeContent::new("two", "second"), None)
                .await
                .unwrap();
            assert_eq!(store.ping().await.unwrap().scopes.len(), 2);
            store.flush().await.unwrap();
        }

        let reopened = open(dir.path());
        let spelled = format!("{}/./app", dir.path().display());
        let view = reopened.read(Level::Project, Some(&spelled)).await.unwrap();
        let mut ids: Vec<&str> = view.nodes.iter().map(|n| n.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["one", "two"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_sync_exactly_once() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(dir.path()).with_lock_timeout_ms(5_000)).unwrap();
        let reader = store.register_session().unwrap();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                tokio::spawn(async move {
                    let me = store.register_session().unwrap();
                    for i in 0..25 {
                        let content = NodeContent::new(format!("w{w}-{i}"), "fact");
                        store.put_node(Level::User, None, content, Some(&me)).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let done = Arc::new(AtomicBool::new(false));
        let syncer = {
            let store = store.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut seen: HashMap<String, usize> = HashMap::new();
                loop {
                    // Read the flag first so the last pass starts after every write.
                    let finished = done.load(Ordering::Acquire);
                    let diff = store.sync(Level::User, None, &reader).await.unwrap();
                    for node in diff.changes.nodes {
                        *seen.entry(node.id).or_default() += 1;
                    }
                    if finished {
                        return seen;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        done.store(true, Ordering::Release);

        let seen = syncer.await.unwrap();
        assert_eq!(seen.len(), 100);
        let repeated: Vec<_> = seen.iter().filter(|(_, count)| **count != 1).collect();
        assert!(repeated.is_empty(), "delivered more than once: {repeated:?}");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_dirty_graphs() {
        let dir = TempDir::new().unwrap();
        let app = project(dir.path(), "app");
        {
            let store = open(dir.path());
            store
                .put_node(Level::User, None, NodeContent::new("u", "user fact"), None)
                .await
                .unwrap();
            store
                .put_node(Level::Project, Some(&app), NodeContent::new("p", "project fact"), None)
                .await
                .unwrap();
            store.shutdown().await.unwrap();
            assert!(!store.ping().await.unwrap().scopes[0].stats.dirty);
        }

        let reopened = open(dir.path());
        let user = reopened.read(Level::User, None).await.unwrap();
        assert_eq!(user.nodes[0].gist, "user fact");
        let proj = reopened.read(Level::Project, Some(&app)).await.unwrap();
        assert_eq!(proj.nodes[0].gist, "project fact");
    }

    #[tokio::test]
    async fn test_reopen_continues_versions_and_clock() {
        let dir = TempDir::new().unwrap();
        let first_stamp = {
            let store = open(dir.path());
            store
                .put_node(Level::User, None, NodeContent::new("n", "one"), None)
                .await
                .unwrap();
            store.delete_node(Level::User, None, "n").await.unwrap();
            store.flush().await.unwrap();
            store.ping().await.unwrap().scopes[0].stats.last_saved_at.unwrap()
        };

        let store = open(dir.path());
        store
            .put_node(Level::User, None, NodeContent::new("n", "two"), None)
            .await
            .unwrap();
        let node = store.read(Level::User, None).await.unwrap().nodes.remove(0);
        assert_eq!(node.version, 3);
        assert!(node.updated_at > first_stamp);
    }

    #[tokio::test]
    async fn test_corrupt_primary_reported_in_ping() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("user.json"), b"not a snapshot").unwrap();

        let store = open(dir.path());
        let ping = store.ping().await.unwrap();
        let user = ping.scope(&Scope::User).unwrap();
        assert!(user.load.lost_data());
        assert_eq!(user.stats.active_node_count, 0);
    }

    #[tokio::test]
    async fn test_save_failure_recorded_and_memory_kept() {
        let dir = TempDir::new().unwrap();
        // A file where the project directory should be makes every save fail.
        fs::write(dir.path().join("blocked"), b"").unwrap();
        let blocked = project(dir.path(), "blocked");

        let store = open(dir.path());
        store
            .put_node(Level::Project, Some(&blocked), NodeContent::new("n", "kept"), None)
            .await
            .unwrap();
        assert!(store.flush().await.is_err());

        let ping = store.ping().await.unwrap();
        let status = ping.scope(&Scope::Project(blocked.clone())).unwrap();
        assert!(status.last_save_error.is_some());
        assert!(status.stats.dirty);
        assert_eq!(store.read(Level::Project, Some(&blocked)).await.unwrap().nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_compact_on_demand() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(dir.path()).with_max_tokens(10)).unwrap();
        store
            .put_node(Level::User, None, NodeContent::new("fresh", "x".repeat(100)), None)
            .await
            .unwrap();

        // Over budget, but everything is inside the protect window.
        let report = store.compact(Level::User, None).await.unwrap();
        assert!(report.compaction.before_tokens > 10);
        assert!(report.compaction.archived.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_loop_saves() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let handle = store.spawn_maintenance();

        store
            .put_node(Level::User, None, NodeContent::new("n", "autosaved"), None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(31)).await;

        assert!(dir.path().join("user.json").exists());
        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_maintenance() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let handle = store.spawn_maintenance();

        store.shutdown().await.unwrap();
        handle.stop().await;
    }
}
