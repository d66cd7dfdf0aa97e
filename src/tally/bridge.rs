//! Tally bridge coordinator.
//!
//! Drains notifier events, collapses bursts of change notifications into a
//! single fetch per debounce window, feeds snapshots through the publisher
//! and fans real changes out to the caller and the relay.
//!
//! A failed fetch leaves the published state untouched and is reported
//! exactly once; the next notification simply tries again.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::relay::RelayHandle;

use super::fetcher::StateFetcher;
use super::notifier::{NotifierConfig, NotifierEvent, TallyNotifier};
use super::publisher::{Publication, TallyPublisher};
use super::state::TallyState;

/// How long shutdown waits for each worker task
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// vMix connection status as seen by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected(String),
}

/// Events delivered to the owner of the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Connection(ConnectionStatus),
    /// Input list changed
    Inputs(TallyState),
    /// Program/preview changed
    Tally(TallyState),
    /// A state fetch failed; the last published state is still current
    FetchFailed(String),
}

/// Bridge timing
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Window during which further change notifications are absorbed
    pub debounce: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
        }
    }
}

/// Debounce, fetch, diff, publish
pub struct TallyBridge<F: StateFetcher> {
    fetcher: F,
    publisher: TallyPublisher,
    config: BridgeConfig,
    events: mpsc::Sender<BridgeEvent>,
    relay: Option<RelayHandle>,
    current: Arc<RwLock<Option<TallyState>>>,
}

impl<F: StateFetcher> TallyBridge<F> {
    pub fn new(
        fetcher: F,
        config: BridgeConfig,
        events: mpsc::Sender<BridgeEvent>,
        relay: Option<RelayHandle>,
    ) -> Self {
        Self {
            fetcher,
            publisher: TallyPublisher::new(),
            config,
            events,
            relay,
            current: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared view of the last published state
    pub fn current(&self) -> Arc<RwLock<Option<TallyState>>> {
        self.current.clone()
    }

    /// Run until the notifier channel closes or `shutdown` flips to true.
    pub async fn run(mut self, mut notifications: mpsc::Receiver<NotifierEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut deadline: Option<Instant> = None;

        loop {
            let fetch_due = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                _ = shutdown.changed() => break,
                event = notifications.recv() => match event {
                    Some(NotifierEvent::Changed) => {
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.config.debounce);
                        }
                    }
                    Some(NotifierEvent::Connected) => {
                        self.emit(BridgeEvent::Connection(ConnectionStatus::Connected)).await;
                        // Initial snapshot after (re)subscribing
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.config.debounce);
                        }
                    }
                    Some(NotifierEvent::Connecting) => {
                        self.emit(BridgeEvent::Connection(ConnectionStatus::Connecting)).await;
                    }
                    Some(NotifierEvent::Disconnected(reason)) => {
                        self.emit(BridgeEvent::Connection(ConnectionStatus::Disconnected(reason))).await;
                    }
                    None => break,
                },
                _ = fetch_due, if deadline.is_some() => {
                    deadline = None;
                    self.refresh().await;
                }
            }
        }

        info!("[Tally] Bridge stopped");
    }

    /// Fetch once and publish whatever changed.
    async fn refresh(&mut self) {
        let state = match self.fetcher.fetch().await {
            Ok(state) => state,
            Err(e) => {
                warn!("[Tally] State fetch failed: {}", e);
                self.emit(BridgeEvent::FetchFailed(e.to_string())).await;
                return;
            }
        };

        let publications = self.publisher.apply(state);
        if publications.is_empty() {
            return;
        }
        *self.current.write() = self.publisher.current().cloned();

        for publication in publications {
            match publication {
                Publication::InputList(state) => {
                    info!("[Tally] Input list updated ({} inputs)", state.inputs.len());
                    if let Some(relay) = &self.relay {
                        relay.send_input_list(&state);
                    }
                    self.emit(BridgeEvent::Inputs(state)).await;
                }
                Publication::Tally(state) => {
                    info!("[Tally] PGM={} PVW={}", state.program, state.preview);
                    if let Some(relay) = &self.relay {
                        relay.send_tally_update(&state);
                    }
                    self.emit(BridgeEvent::Tally(state)).await;
                }
            }
        }
    }

    async fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Running notifier + bridge pair
pub struct TallyHandle {
    shutdown: watch::Sender<bool>,
    notifier: JoinHandle<()>,
    bridge: JoinHandle<()>,
    current: Arc<RwLock<Option<TallyState>>>,
}

impl TallyHandle {
    /// Last published state, if any
    pub fn current(&self) -> Option<TallyState> {
        self.current.read().clone()
    }

    /// Signal both tasks and wait for them to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in [("notifier", self.notifier), ("bridge", self.bridge)] {
            let abort = task.abort_handle();
            if tokio::time::timeout(JOIN_TIMEOUT, task).await.is_err() {
                warn!("[Tally] {} did not stop within {:?}, aborting", name, JOIN_TIMEOUT);
                abort.abort();
            }
        }
    }
}

/// Start a notifier and bridge on the current tokio runtime.
pub fn spawn<F: StateFetcher>(
    notifier: NotifierConfig,
    fetcher: F,
    config: BridgeConfig,
    relay: Option<RelayHandle>,
    events: mpsc::Sender<BridgeEvent>,
) -> TallyHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (notify_tx, notify_rx) = mpsc::channel(64);

    let bridge = TallyBridge::new(fetcher, config, events, relay);
    let current = bridge.current();

    let notifier = tokio::spawn(TallyNotifier::new(notifier, notify_tx).run(shutdown_rx.clone()));
    let bridge = tokio::spawn(bridge.run(notify_rx, shutdown_rx));

    TallyHandle {
        shutdown,
        notifier,
        bridge,
        current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{relay_queue, MessageKind};
    use crate::tally::{InputDescriptor, TallyError};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves queued results, then repeats the fallback state
    #[derive(Clone)]
    struct MockFetcher {
        calls: Arc<AtomicUsize>,
        queued: Arc<Mutex<VecDeque<Result<TallyState, TallyError>>>>,
        fallback: TallyState,
    }

    impl MockFetcher {
        fn new(fallback: TallyState) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                queued: Arc::new(Mutex::new(VecDeque::new())),
                fallback,
            }
        }

        fn push(&self, result: Result<TallyState, TallyError>) {
            self.queued.lock().push_back(result);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl StateFetcher for MockFetcher {
        async fn fetch(&self) -> Result<TallyState, TallyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.queued.lock().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn state(pgm: u32, pvw: u32) -> TallyState {
        TallyState::new(
            pgm,
            pvw,
            [
                InputDescriptor::new(1, "Cam 1", "Capture"),
                InputDescriptor::new(2, "Cam 2", "Capture"),
            ],
        )
    }

    struct Harness {
        notify: mpsc::Sender<NotifierEvent>,
        events: mpsc::Receiver<BridgeEvent>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
        current: Arc<RwLock<Option<TallyState>>>,
    }

    fn start(fetcher: MockFetcher, relay: Option<RelayHandle>) -> Harness {
        let (notify, notify_rx) = mpsc::channel(64);
        let (events_tx, events) = mpsc::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let bridge = TallyBridge::new(fetcher, BridgeConfig::default(), events_tx, relay);
        let current = bridge.current();
        let task = tokio::spawn(bridge.run(notify_rx, shutdown_rx));
        Harness {
            notify,
            events,
            shutdown,
            task,
            current,
        }
    }

    fn drain(events: &mut mpsc::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_fetch() {
        let fetcher = MockFetcher::new(state(1, 2));
        let mut h = start(fetcher.clone(), None);

        for _ in 0..10 {
            h.notify.send(NotifierEvent::Changed).await.unwrap();
        }
        settle().await;
        assert_eq!(fetcher.calls(), 1);

        // A later burst gets its own fetch
        h.notify.send(NotifierEvent::Changed).await.unwrap();
        h.notify.send(NotifierEvent::Changed).await.unwrap();
        settle().await;
        assert_eq!(fetcher.calls(), 2);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_results_publish_once() {
        let fetcher = MockFetcher::new(state(1, 2));
        let mut h = start(fetcher.clone(), None);

        h.notify.send(NotifierEvent::Changed).await.unwrap();
        settle().await;
        h.notify.send(NotifierEvent::Changed).await.unwrap();
        settle().await;

        assert_eq!(fetcher.calls(), 2);
        let events = drain(&mut h.events);
        assert_eq!(
            events,
            vec![BridgeEvent::Inputs(state(1, 2)), BridgeEvent::Tally(state(1, 2))]
        );

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_keeps_cached_state() {
        let fetcher = MockFetcher::new(state(2, 1));
        fetcher.push(Ok(state(1, 2)));
        fetcher.push(Err(TallyError::Parse("truncated".to_string())));
        let mut h = start(fetcher.clone(), None);

        h.notify.send(NotifierEvent::Changed).await.unwrap();
        settle().await;
        drain(&mut h.events);

        h.notify.send(NotifierEvent::Changed).await.unwrap();
        settle().await;
        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BridgeEvent::FetchFailed(_)));
        assert_eq!(h.current.read().as_ref().unwrap().buses(), (1, 2));

        // Recovery publishes the new state
        h.notify.send(NotifierEvent::Changed).await.unwrap();
        settle().await;
        assert_eq!(drain(&mut h.events), vec![BridgeEvent::Tally(state(2, 1))]);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_triggers_initial_fetch() {
        let fetcher = MockFetcher::new(state(1, 2));
        let mut h = start(fetcher.clone(), None);

        h.notify.send(NotifierEvent::Connecting).await.unwrap();
        h.notify.send(NotifierEvent::Connected).await.unwrap();
        settle().await;

        assert_eq!(fetcher.calls(), 1);
        let events = drain(&mut h.events);
        assert_eq!(events[0], BridgeEvent::Connection(ConnectionStatus::Connecting));
        assert_eq!(events[1], BridgeEvent::Connection(ConnectionStatus::Connected));
        assert_eq!(events.len(), 4);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_forwarded_to_relay() {
        let (relay, mut queue) = relay_queue();
        let fetcher = MockFetcher::new(state(1, 2));
        let h = start(fetcher, Some(relay));

        h.notify.send(NotifierEvent::Changed).await.unwrap();
        settle().await;

        let first = queue.try_recv().unwrap();
        let second = queue.try_recv().unwrap();
        assert_eq!(first.kind, MessageKind::InputList);
        assert_eq!(second.kind, MessageKind::TallyUpdate);
        assert_eq!(second.tally_summary().unwrap().0, 1);
        assert!(queue.try_recv().is_err());

        drop(h.notify);
        h.task.await.unwrap();
    }
}
