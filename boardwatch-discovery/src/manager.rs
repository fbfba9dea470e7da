//! Supervises every configured discovery and merges their ports.
//!
//! The [`DiscoveryManager`] keeps one [`DiscoverySession`] per discovery,
//! reused across calls and recreated when its process died. Each session sits
//! behind its own async mutex so one command is in flight per session, while
//! different sessions are driven concurrently on a [`JoinSet`].
//!
//! Events from the sessions flow through an unbounded channel to a single
//! owner of the [`PortAggregator`]: the `list_ports` call itself, or the
//! collector task of a [`WatchStream`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::aggregator::{PortAggregator, PortSnapshot};
use crate::boards::BoardCatalog;
use crate::client::EventSender;
use crate::descriptor::{DiscoveryDescriptor, DiscoveryId};
use crate::error::{ManagerError, SessionResult};
use crate::port::{DiscoveryEvent, DiscoveryWarning, Port};
use crate::registry::DiscoveryRegistry;
use crate::session::{DiscoverySession, SessionOptions, SessionState};

type SharedSession = Arc<Mutex<DiscoverySession>>;

/// How `list_ports` enumerates a discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListStrategy {
    /// `START_SYNC`, then collect events until the stream settles.
    #[default]
    Sync,
    /// `START`, `LIST`, `STOP` and take the listed ports.
    Poll,
}

/// Timing knobs for the manager and its sessions.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub session: SessionOptions,
    /// `list_ports` stops collecting after this long without an event.
    pub settle_quiet: Duration,
    /// Overall bound for `list_ports` bring-up and collection.
    pub list_timeout: Duration,
    pub strategy: ListStrategy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            settle_quiet: Duration::from_secs(1),
            list_timeout: Duration::from_secs(10),
            strategy: ListStrategy::Sync,
        }
    }
}

/// Outcome of one `list_ports` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResult {
    pub ports: PortSnapshot,
    pub warnings: Vec<DiscoveryWarning>,
}

enum Outcome {
    Running,
    Listed(Vec<Port>),
    Failed(String),
}

struct Inner {
    registry: DiscoveryRegistry,
    options: ManagerOptions,
    sessions: parking_lot::Mutex<IndexMap<DiscoveryId, SharedSession>>,
    watch_active: Arc<AtomicBool>,
}

/// Entry point of the discovery subsystem. Cheap to clone; clones share
/// their sessions.
#[derive(Clone)]
pub struct DiscoveryManager {
    inner: Arc<Inner>,
    catalog: Arc<BoardCatalog>,
}

impl DiscoveryManager {
    pub fn new(registry: DiscoveryRegistry, options: ManagerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                options,
                sessions: parking_lot::Mutex::new(IndexMap::new()),
                watch_active: Arc::new(AtomicBool::new(false)),
            }),
            catalog: Arc::new(BoardCatalog::default()),
        }
    }

    /// Use `catalog` to fill the `boards` of every reported port.
    ///
    /// Applies to this handle and to clones made from it afterwards.
    pub fn with_board_catalog(mut self, catalog: BoardCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn board_catalog(&self) -> &BoardCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.inner.registry
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub fn is_watching(&self) -> bool {
        self.inner.watch_active.load(Ordering::SeqCst)
    }

    fn session_for(&self, descriptor: &DiscoveryDescriptor) -> SharedSession {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions.entry(descriptor.id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(DiscoverySession::new(
                descriptor.clone(),
                self.inner.options.session.clone(),
            )))
        });
        Arc::clone(session)
    }

    // -----------------------------------------------------------------------
    // list_ports
    // -----------------------------------------------------------------------

    /// Enumerate the ports of every configured discovery.
    ///
    /// Per-discovery failures become warnings; ports are merged per
    /// discovery in configured order so repeated calls on an unchanged
    /// system return the same ordering.
    ///
    /// # Errors
    /// [`ManagerError::WatchInProgress`] while a watch stream is active and
    /// [`ManagerError::Worker`] if a session task panicked.
    pub async fn list_ports(&self) -> Result<ListResult, ManagerError> {
        if self.is_watching() {
            return Err(ManagerError::WatchInProgress);
        }
        let options = &self.inner.options;
        let deadline = Instant::now() + options.list_timeout;
        let (descriptors, mut warnings) = self.inner.registry.resolve_all();
        log::info!(
            "listing ports from {} discovery(ies) using {:?}",
            descriptors.len(),
            options.strategy
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = self.spawn_bring_up(&descriptors, options.strategy, &tx, deadline);
        drop(tx);

        let mut buffered: HashMap<DiscoveryId, Vec<DiscoveryEvent>> = HashMap::new();
        let mut outcomes: Vec<Option<Outcome>> = descriptors.iter().map(|_| None).collect();
        let mut worker_failure = None;

        while !set.is_empty() {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((index, outcome))) => outcomes[index] = Some(outcome),
                    Some(Err(e)) => {
                        log::error!("discovery worker failed: {e}");
                        worker_failure = Some(e.to_string());
                    }
                    None => {}
                },
                Some(event) = rx.recv() => {
                    buffered.entry(event.discovery().clone()).or_default().push(event);
                }
            }
        }

        let streaming = outcomes
            .iter()
            .any(|o| matches!(o, Some(Outcome::Running)));
        if streaming {
            settle(&mut rx, &mut buffered, options.settle_quiet, deadline).await;
        }

        let stop_failures = self.stop_running(&descriptors, &outcomes, deadline).await;
        while let Ok(event) = rx.try_recv() {
            buffered.entry(event.discovery().clone()).or_default().push(event);
        }

        let mut aggregator = PortAggregator::new();
        for (descriptor, outcome) in descriptors.iter().zip(outcomes) {
            let id = &descriptor.id;
            match outcome {
                Some(Outcome::Running) => {
                    for event in buffered.remove(id).unwrap_or_default() {
                        if let DiscoveryEvent::Error { message, .. } = &event {
                            warnings.push(DiscoveryWarning::new(id.clone(), message.clone()));
                        }
                        aggregator.apply(&event);
                    }
                }
                Some(Outcome::Listed(ports)) => {
                    for port in ports {
                        aggregator.apply(&DiscoveryEvent::Added {
                            discovery: id.clone(),
                            port,
                        });
                    }
                }
                Some(Outcome::Failed(reason)) => {
                    log::debug!("discovery {id}: {reason}");
                    warnings.push(DiscoveryWarning::new(id.clone(), reason));
                }
                None => {}
            }
        }
        warnings.extend(stop_failures);

        if let Some(message) = worker_failure {
            return Err(ManagerError::Worker(message));
        }

        let mut ports = aggregator.snapshot();
        self.catalog.annotate(&mut ports);
        log::info!(
            "listed {} port(s) with {} warning(s)",
            ports.len(),
            warnings.len()
        );
        Ok(ListResult { ports, warnings })
    }

    /// Bring every session up concurrently. Each task reports its index into
    /// `descriptors` with the outcome; a task that misses `deadline` quits
    /// its session.
    fn spawn_bring_up(
        &self,
        descriptors: &[DiscoveryDescriptor],
        strategy: ListStrategy,
        tx: &EventSender,
        deadline: Instant,
    ) -> JoinSet<(usize, Outcome)> {
        let mut set = JoinSet::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            let session = self.session_for(descriptor);
            let descriptor = descriptor.clone();
            let options = self.inner.options.session.clone();
            let tx = tx.clone();
            let timeout = self.inner.options.list_timeout;

            set.spawn(async move {
                let work = async {
                    let mut session = session.lock().await;
                    prepare(&mut session, &descriptor, &options).await;
                    match strategy {
                        ListStrategy::Sync => bring_up(&mut session, tx)
                            .await
                            .map(|()| Outcome::Running),
                        ListStrategy::Poll => poll(&mut session).await.map(Outcome::Listed),
                    }
                };
                let result = tokio::time::timeout_at(deadline, work).await;
                let outcome = match result {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => Outcome::Failed(e.to_string()),
                    Err(_) => {
                        session.lock().await.quit().await;
                        Outcome::Failed(format!(
                            "timed out after {}ms",
                            timeout.as_millis()
                        ))
                    }
                };
                (index, outcome)
            });
        }
        set
    }

    /// Stop the sessions that reached Running. Sessions that died meanwhile
    /// already reported an error event and are skipped.
    ///
    /// `STOP` must be answered within one quit grace period past `deadline`;
    /// a session that misses it is quit and reported.
    async fn stop_running(
        &self,
        descriptors: &[DiscoveryDescriptor],
        outcomes: &[Option<Outcome>],
        deadline: Instant,
    ) -> Vec<DiscoveryWarning> {
        let grace = self.inner.options.session.quit_grace;
        let stop_deadline = deadline + grace;
        let mut set = JoinSet::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            if !matches!(outcomes[index], Some(Outcome::Running)) {
                continue;
            }
            let session = self.session_for(descriptor);
            set.spawn(async move {
                let work = async {
                    let mut session = session.lock().await;
                    if session.refresh() != SessionState::Running {
                        return Ok(());
                    }
                    session.stop().await.map_err(|e| e.to_string())
                };
                let result = tokio::time::timeout_at(stop_deadline, work).await;
                match result {
                    Ok(stopped) => (index, stopped),
                    Err(_) => {
                        session.lock().await.quit().await;
                        (
                            index,
                            Err(format!(
                                "STOP not answered within {}ms of the list timeout, discovery killed",
                                grace.as_millis()
                            )),
                        )
                    }
                }
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Err(reason))) => {
                    log::debug!("discovery {}: {reason}", descriptors[index].id);
                    let warning = DiscoveryWarning::new(descriptors[index].id.clone(), reason);
                    failures.push((index, warning));
                }
                Ok((_, Ok(()))) => {}
                Err(e) => log::error!("discovery stop task failed: {e}"),
            }
        }
        failures.sort_by_key(|(index, _)| *index);
        failures.into_iter().map(|(_, warning)| warning).collect()
    }

    // -----------------------------------------------------------------------
    // watch
    // -----------------------------------------------------------------------

    /// Start streaming every discovery into a live [`WatchStream`].
    ///
    /// Resolution and start failures are delivered as `Error` events at the
    /// head of the stream.
    ///
    /// # Errors
    /// [`ManagerError::WatchInProgress`] if another stream is still active.
    pub async fn watch(&self) -> Result<WatchStream, ManagerError> {
        if self
            .inner
            .watch_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ManagerError::WatchInProgress);
        }
        let guard = ActiveWatch(Arc::clone(&self.inner.watch_active));

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (descriptors, warnings) = self.inner.registry.resolve_all();
        for warning in warnings {
            log::warn!("{warning}");
            let _ = out_tx.send(DiscoveryEvent::Error {
                discovery: warning.discovery,
                message: warning.reason,
            });
        }

        let deadline = Instant::now() + self.inner.options.list_timeout;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut set = self.spawn_bring_up(&descriptors, ListStrategy::Sync, &tx, deadline);
        drop(tx);

        let mut outcomes: Vec<Option<Outcome>> = descriptors.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => log::error!("discovery worker failed: {e}"),
            }
        }

        let mut watched = Vec::new();
        for (descriptor, outcome) in descriptors.iter().zip(outcomes) {
            match outcome {
                Some(Outcome::Running) => watched.push(self.session_for(descriptor)),
                Some(Outcome::Failed(message)) => {
                    log::warn!("discovery {}: {message}", descriptor.id);
                    let _ = out_tx.send(DiscoveryEvent::Error {
                        discovery: descriptor.id.clone(),
                        message,
                    });
                }
                Some(Outcome::Listed(_)) | None => {}
            }
        }
        log::info!("watching {} discovery(ies)", watched.len());

        let (snapshot_tx, snapshot_rx) = watch::channel(PortSnapshot::default());
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(collect(Collector {
            events: rx,
            out: Some(out_tx),
            snapshot: snapshot_tx,
            cancel: cancel_rx,
            sessions: watched,
            catalog: Arc::clone(&self.catalog),
            _guard: guard,
        }));

        Ok(WatchStream {
            events: out_rx,
            snapshot: snapshot_rx,
            cancel: Some(cancel_tx),
            task: Some(task),
        })
    }

    // -----------------------------------------------------------------------
    // shutdown / diagnostics
    // -----------------------------------------------------------------------

    /// Quit every session concurrently. When this returns no discovery
    /// process is left running.
    pub async fn shutdown(&self) {
        let sessions: Vec<SharedSession> = {
            let mut map = self.inner.sessions.lock();
            map.drain(..).map(|(_, session)| session).collect()
        };
        if sessions.is_empty() {
            return;
        }
        log::info!("shutting down {} discovery session(s)", sessions.len());
        quit_all(sessions).await;
    }

    /// State of every known session, in creation order.
    pub async fn session_states(&self) -> Vec<(DiscoveryId, SessionState)> {
        let sessions: Vec<(DiscoveryId, SharedSession)> = self
            .inner
            .sessions
            .lock()
            .iter()
            .map(|(id, session)| (id.clone(), Arc::clone(session)))
            .collect();
        let mut states = Vec::with_capacity(sessions.len());
        for (id, session) in sessions {
            let state = session.lock().await.refresh();
            states.push((id, state));
        }
        states
    }

    /// OS process ids of the sessions holding a process.
    pub async fn session_pids(&self) -> Vec<(DiscoveryId, u32)> {
        let sessions: Vec<SharedSession> = self.inner.sessions.lock().values().cloned().collect();
        let mut pids = Vec::new();
        for session in sessions {
            let session = session.lock().await;
            if let Some(pid) = session.pid() {
                pids.push((session.id().clone(), pid));
            }
        }
        pids
    }
}

/// Replace a dead or outdated session with a fresh one.
async fn prepare(
    session: &mut DiscoverySession,
    descriptor: &DiscoveryDescriptor,
    options: &SessionOptions,
) {
    let state = session.refresh();
    if session.descriptor() != descriptor {
        log::info!("discovery {}: installation changed, restarting", descriptor.id);
        session.quit().await;
    } else if state != SessionState::Dead {
        return;
    }
    *session = DiscoverySession::new(descriptor.clone(), options.clone());
}

async fn bring_up(session: &mut DiscoverySession, events: EventSender) -> SessionResult<()> {
    if session.state() == SessionState::Inactive {
        session.start().await?;
    }
    if session.state() == SessionState::Running {
        session.stop().await?;
    }
    session.start_sync(events).await
}

async fn poll(session: &mut DiscoverySession) -> SessionResult<Vec<Port>> {
    if session.state() == SessionState::Inactive {
        session.start().await?;
    }
    if session.state() == SessionState::Running {
        session.stop().await?;
    }
    session.list().await
}

/// Collect events until none arrived for `quiet` or `deadline` passed.
async fn settle(
    rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>,
    buffered: &mut HashMap<DiscoveryId, Vec<DiscoveryEvent>>,
    quiet: Duration,
    deadline: Instant,
) {
    loop {
        let until = (Instant::now() + quiet).min(deadline);
        match tokio::time::timeout_at(until, rx.recv()).await {
            Ok(Some(event)) => buffered
                .entry(event.discovery().clone())
                .or_default()
                .push(event),
            Ok(None) | Err(_) => break,
        }
    }
}

async fn quit_all(sessions: Vec<SharedSession>) {
    let mut set = JoinSet::new();
    for session in sessions {
        set.spawn(async move { session.lock().await.quit().await });
    }
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            log::error!("discovery quit task failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Watch stream
// ---------------------------------------------------------------------------

/// Clears the active-watch flag when the collector finishes.
struct ActiveWatch(Arc<AtomicBool>);

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Collector {
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    /// Closed once no session can send anymore; the watch stays active
    /// until cancelled.
    out: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    snapshot: watch::Sender<PortSnapshot>,
    cancel: oneshot::Receiver<()>,
    sessions: Vec<SharedSession>,
    catalog: Arc<BoardCatalog>,
    _guard: ActiveWatch,
}

async fn collect(mut collector: Collector) {
    let mut aggregator = PortAggregator::new();
    loop {
        let open = collector.out.is_some();
        tokio::select! {
            _ = &mut collector.cancel => break,
            event = collector.events.recv(), if open => match event {
                Some(event) => {
                    if let DiscoveryEvent::Error { discovery, message } = &event {
                        log::warn!("discovery {discovery}: {message}");
                    }
                    aggregator.apply(&event);
                    let mut snapshot = aggregator.snapshot();
                    collector.catalog.annotate(&mut snapshot);
                    collector.snapshot.send_replace(snapshot);
                    let delivered = collector
                        .out
                        .as_ref()
                        .is_some_and(|out| out.send(event).is_ok());
                    if !delivered {
                        break;
                    }
                }
                None => {
                    log::debug!("all watched discoveries detached");
                    collector.out = None;
                }
            },
        }
    }
    log::info!("watch ended, quitting {} session(s)", collector.sessions.len());
    quit_all(std::mem::take(&mut collector.sessions)).await;
}

/// Live feed of discovery events with the merged snapshot alongside.
///
/// Dropping the stream cancels it; sessions are quit in the background.
pub struct WatchStream {
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    snapshot: watch::Receiver<PortSnapshot>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchStream {
    /// Next event, or `None` once the watch ended.
    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }

    /// Merged ports after every event delivered so far.
    pub fn snapshot(&self) -> PortSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Stop watching and wait until every watched session has quit.
    ///
    /// # Errors
    /// [`ManagerError::Worker`] if the collector task panicked.
    pub async fn cancel(mut self) -> Result<(), ManagerError> {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        match self.task.take() {
            Some(task) => task.await.map_err(|e| ManagerError::Worker(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}
