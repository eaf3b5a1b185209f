//! Ingestion orchestrator
//!
//! Picks streaming when the substreams CLI and its credential are present,
//! otherwise polls the REST chain. Streaming exits drop straight into
//! polling while a supervisor relaunches the process after a fixed delay.
//! Polling cycles are skipped whenever a streaming session is live.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::oracle::sources::StreamingSource;
use crate::oracle::{FallbackChain, IngestSink};
use crate::shutdown::ShutdownListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Selecting,
    Streaming,
    PollingPrimary,
    PollingSecondary,
    /// Every polled source failed in the last cycle. Not sticky.
    Exhausted,
}

impl std::fmt::Display for IngestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            IngestState::Selecting => "selecting",
            IngestState::Streaming => "streaming",
            IngestState::PollingPrimary => "polling_primary",
            IngestState::PollingSecondary => "polling_secondary",
            IngestState::Exhausted => "exhausted",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorTiming {
    pub poll_interval: Duration,
    pub restart_delay: Duration,
}

impl Default for OrchestratorTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            restart_delay: Duration::from_secs(5),
        }
    }
}

pub struct IngestOrchestrator {
    streaming: Option<Arc<dyn StreamingSource>>,
    chain: FallbackChain,
    sink: IngestSink,
    timing: OrchestratorTiming,
    state_tx: watch::Sender<IngestState>,
    streaming_available: AtomicBool,
    streaming_live: AtomicBool,
    /// Wakes the poll loop when streaming goes down. The poll loop still
    /// keeps cycles at least `poll_interval` apart.
    fallback: Notify,
}

impl IngestOrchestrator {
    pub fn new(
        streaming: Option<Arc<dyn StreamingSource>>,
        chain: FallbackChain,
        sink: IngestSink,
        timing: OrchestratorTiming,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(IngestState::Selecting);
        Self {
            streaming,
            chain,
            sink,
            timing,
            state_tx,
            streaming_available: AtomicBool::new(false),
            streaming_live: AtomicBool::new(false),
            fallback: Notify::new(),
        }
    }

    pub fn state(&self) -> IngestState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<IngestState> {
        self.state_tx.subscribe()
    }

    /// Probe result from startup
    pub fn streaming_available(&self) -> bool {
        self.streaming_available.load(Ordering::Acquire)
    }

    pub fn streaming_live(&self) -> bool {
        self.streaming_live.load(Ordering::Acquire)
    }

    fn set_state(&self, next: IngestState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Ingestion state changed");
        }
    }

    /// Run until shutdown
    pub async fn run(self: Arc<Self>, shutdown: ShutdownListener) {
        self.set_state(IngestState::Selecting);

        let streaming = match self.streaming.clone() {
            Some(source) => source.probe().await.then_some(source),
            None => None,
        };
        self.streaming_available
            .store(streaming.is_some(), Ordering::Release);

        let supervisor = match streaming {
            Some(source) => {
                info!(source = %source.name(), "📡 Streaming available, using substreams");
                self.streaming_live.store(true, Ordering::Release);
                self.set_state(IngestState::Streaming);

                let this = self.clone();
                let listener = shutdown.clone();
                Some(tokio::spawn(async move {
                    this.supervise(source, listener).await;
                }))
            }
            None => {
                info!(sources = ?self.chain.names(), "Streaming unavailable, polling REST sources");
                self.set_state(IngestState::PollingPrimary);
                None
            }
        };

        self.poll_loop(shutdown).await;

        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(error = %e, "Streaming supervisor panicked");
            }
        }
        info!("Ingestion orchestrator stopped");
    }

    async fn supervise(&self, source: Arc<dyn StreamingSource>, mut shutdown: ShutdownListener) {
        loop {
            if shutdown.is_triggered() {
                break;
            }

            match source.launch().await {
                Ok(session) => {
                    self.streaming_live.store(true, Ordering::Release);
                    self.set_state(IngestState::Streaming);

                    let exit = session.consume(&self.sink, shutdown.clone()).await;
                    if exit.cancelled {
                        break;
                    }
                    warn!(
                        source = %source.name(),
                        code = ?exit.code,
                        written = exit.written,
                        "Streaming process exited, falling back to polling"
                    );
                }
                Err(e) => {
                    error!(source = %source.name(), error = %e, "Failed to launch streaming, falling back to polling");
                }
            }

            let was_live = self.streaming_live.swap(false, Ordering::AcqRel);
            self.set_state(IngestState::PollingPrimary);
            if was_live {
                self.fallback.notify_one();
            }

            let delay_ms = self.timing.restart_delay.as_millis() as u64;
            info!(source = %source.name(), delay_ms, "Streaming restart scheduled");
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(self.timing.restart_delay) => {}
            }
            info!(source = %source.name(), "Restarting streaming");
        }

        self.streaming_live.store(false, Ordering::Release);
    }

    async fn poll_loop(&self, mut shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval(self.timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_cycle: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
                _ = self.fallback.notified() => {
                    let recent = last_cycle
                        .map(|at| at.elapsed() < self.timing.poll_interval)
                        .unwrap_or(false);
                    if recent {
                        debug!("Streaming stopped, keeping poll schedule");
                        continue;
                    }
                    debug!("Streaming stopped, polling immediately");
                    ticker.reset();
                }
            }

            if self.streaming_live() {
                debug!("Streaming live, skipping poll cycle");
                continue;
            }

            let outcome = self.chain.run_cycle(&self.sink).await;
            last_cycle = Some(Instant::now());
            if !self.streaming_live() {
                self.set_state(outcome.state());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::sources::{PriceAdapter, SourceError, StreamExit, StreamSession};
    use crate::oracle::IngestHealth;
    use crate::persistence::CsvPriceStore;
    use crate::shutdown::Shutdown;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant as StdInstant;

    type EventLog = Arc<Mutex<Vec<(&'static str, StdInstant)>>>;

    struct FakeAdapter {
        result: fn() -> Result<usize, SourceError>,
        polls: Arc<AtomicUsize>,
        log: EventLog,
    }

    #[async_trait]
    impl PriceAdapter for FakeAdapter {
        fn name(&self) -> &'static str {
            "Fake"
        }

        async fn poll(&self, _sink: &IngestSink) -> Result<usize, SourceError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(("poll", StdInstant::now()));
            (self.result)()
        }
    }

    /// Streaming source whose launches fail, or whose sessions either end at
    /// once or run until shutdown
    struct FakeStreaming {
        available: bool,
        launch_fails: bool,
        exits_immediately: bool,
        log: EventLog,
    }

    struct FakeSession {
        exits_immediately: bool,
    }

    #[async_trait]
    impl StreamingSource for FakeStreaming {
        fn name(&self) -> &'static str {
            "FakeStream"
        }

        async fn probe(&self) -> bool {
            self.available
        }

        async fn launch(&self) -> Result<Box<dyn StreamSession>, SourceError> {
            self.log.lock().unwrap().push(("launch", StdInstant::now()));
            if self.launch_fails {
                return Err(SourceError::Spawn {
                    adapter: "FakeStream",
                    message: "binary crashed".to_string(),
                });
            }
            Ok(Box::new(FakeSession {
                exits_immediately: self.exits_immediately,
            }))
        }
    }

    #[async_trait]
    impl StreamSession for FakeSession {
        async fn consume(self: Box<Self>, _sink: &IngestSink, mut shutdown: ShutdownListener) -> StreamExit {
            if self.exits_immediately {
                return StreamExit {
                    code: Some(1),
                    ..StreamExit::default()
                };
            }
            shutdown.wait().await;
            StreamExit {
                cancelled: true,
                ..StreamExit::default()
            }
        }
    }

    fn sink() -> IngestSink {
        let dir = std::env::temp_dir().join(format!(
            "price_ingest_orchestrator_{}",
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(CsvPriceStore::open(dir).unwrap());
        IngestSink::new(store, Arc::new(IngestHealth::new()))
    }

    fn timing(poll_ms: u64, restart_ms: u64) -> OrchestratorTiming {
        OrchestratorTiming {
            poll_interval: Duration::from_millis(poll_ms),
            restart_delay: Duration::from_millis(restart_ms),
        }
    }

    fn build(
        streaming: Option<FakeStreaming>,
        result: fn() -> Result<usize, SourceError>,
        timing: OrchestratorTiming,
        log: EventLog,
    ) -> (Arc<IngestOrchestrator>, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        let adapter: Arc<dyn PriceAdapter> = Arc::new(FakeAdapter {
            result,
            polls: polls.clone(),
            log,
        });
        let streaming = streaming.map(|s| Arc::new(s) as Arc<dyn StreamingSource>);
        let orchestrator = Arc::new(IngestOrchestrator::new(
            streaming,
            FallbackChain::new(vec![adapter]),
            sink(),
            timing,
        ));
        (orchestrator, polls)
    }

    async fn stop(shutdown: Shutdown, handle: tokio::task::JoinHandle<()>) {
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("orchestrator should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn without_streaming_polls_immediately() {
        let log: EventLog = Arc::default();
        let (orchestrator, polls) = build(None, || Ok(2), timing(10_000, 100), log);
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(orchestrator.clone().run(shutdown.listener()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(!orchestrator.streaming_available());
        assert_eq!(orchestrator.state(), IngestState::PollingPrimary);

        stop(shutdown, handle).await;
    }

    #[tokio::test]
    async fn failing_chain_reports_exhausted() {
        let log: EventLog = Arc::default();
        let (orchestrator, _polls) = build(
            None,
            || Err(SourceError::Timeout { adapter: "Fake" }),
            timing(10_000, 100),
            log,
        );
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(orchestrator.clone().run(shutdown.listener()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orchestrator.state(), IngestState::Exhausted);

        stop(shutdown, handle).await;
    }

    #[tokio::test]
    async fn live_streaming_suppresses_polling() {
        let log: EventLog = Arc::default();
        let streaming = FakeStreaming {
            available: true,
            launch_fails: false,
            exits_immediately: false,
            log: log.clone(),
        };
        let (orchestrator, polls) = build(Some(streaming), || Ok(1), timing(20, 100), log);
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(orchestrator.clone().run(shutdown.listener()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(orchestrator.streaming_available());
        assert!(orchestrator.streaming_live());
        assert_eq!(orchestrator.state(), IngestState::Streaming);
        assert_eq!(polls.load(Ordering::SeqCst), 0);

        stop(shutdown, handle).await;
        assert!(!orchestrator.streaming_live());
    }

    #[tokio::test]
    async fn streaming_exit_polls_before_delayed_restart() {
        let log: EventLog = Arc::default();
        let streaming = FakeStreaming {
            available: true,
            launch_fails: false,
            exits_immediately: true,
            log: log.clone(),
        };
        let restart = Duration::from_millis(200);
        let (orchestrator, _polls) = build(Some(streaming), || Ok(1), timing(10_000, 200), log.clone());
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(orchestrator.clone().run(shutdown.listener()));

        tokio::time::sleep(Duration::from_millis(320)).await;
        stop(shutdown, handle).await;

        let events = log.lock().unwrap().clone();
        let kinds: Vec<&str> = events.iter().map(|(kind, _)| *kind).collect();
        assert!(kinds.len() >= 3, "events: {:?}", kinds);
        assert_eq!(&kinds[..3], &["launch", "poll", "launch"]);

        let launches: Vec<StdInstant> = events
            .iter()
            .filter(|(kind, _)| *kind == "launch")
            .map(|(_, at)| *at)
            .collect();
        assert!(launches[1].duration_since(launches[0]) >= restart);
    }

    fn times_of(log: &EventLog, kind: &str) -> Vec<StdInstant> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, at)| *at)
            .collect()
    }

    #[tokio::test]
    async fn launch_failure_falls_back_and_retries_after_delay() {
        let log: EventLog = Arc::default();
        let streaming = FakeStreaming {
            available: true,
            launch_fails: true,
            exits_immediately: false,
            log: log.clone(),
        };
        let restart = Duration::from_millis(150);
        let (orchestrator, polls) = build(Some(streaming), || Ok(1), timing(10_000, 150), log.clone());
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(orchestrator.clone().run(shutdown.listener()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.streaming_available());
        assert!(!orchestrator.streaming_live());
        assert_eq!(orchestrator.state(), IngestState::PollingPrimary);
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        stop(shutdown, handle).await;

        let launches = times_of(&log, "launch");
        assert!(launches.len() >= 2, "launches: {}", launches.len());
        for pair in launches.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= restart);
        }
    }

    #[tokio::test]
    async fn repeated_launch_failures_keep_poll_interval() {
        let log: EventLog = Arc::default();
        let streaming = FakeStreaming {
            available: true,
            launch_fails: true,
            exits_immediately: false,
            log: log.clone(),
        };
        let poll_interval = Duration::from_millis(300);
        let (orchestrator, _polls) = build(Some(streaming), || Ok(1), timing(300, 40), log.clone());
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(orchestrator.clone().run(shutdown.listener()));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        stop(shutdown, handle).await;

        let launches = times_of(&log, "launch");
        let polls = times_of(&log, "poll");
        assert!(launches.len() >= 10, "launches: {}", launches.len());
        assert!(polls.len() <= 4, "polls: {}", polls.len());
        for pair in polls.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(
                gap + Duration::from_millis(20) >= poll_interval,
                "polls {:?} apart",
                gap
            );
        }
    }

    #[tokio::test]
    async fn repeated_session_exits_keep_poll_interval() {
        let log: EventLog = Arc::default();
        let streaming = FakeStreaming {
            available: true,
            launch_fails: false,
            exits_immediately: true,
            log: log.clone(),
        };
        let (orchestrator, _polls) = build(Some(streaming), || Ok(1), timing(10_000, 40), log.clone());
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(orchestrator.clone().run(shutdown.listener()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        stop(shutdown, handle).await;

        assert!(times_of(&log, "launch").len() >= 5);
        assert_eq!(times_of(&log, "poll").len(), 1);
    }
}
