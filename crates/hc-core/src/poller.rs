//! Drives one check on its interval.
//!
//! Every tick runs a cycle: the probe gets half the interval, then all sinks
//! together get the other half. A cycle therefore never outlasts its
//! interval, whatever the network does.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::ProbeError;
use crate::group::{Policy, TaskGroup};
use crate::probe::Probe;
use crate::sink::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Checking,
    Sinking,
    Stopped,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Checking => write!(f, "checking"),
            Self::Sinking => write!(f, "sinking"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    Passed,
    Failed(ProbeError),
    /// The outer token fired during the check; sinks were not called.
    Cancelled,
}

pub struct Poller {
    name: String,
    interval: Duration,
    probe: Arc<dyn Probe>,
    sinks: Vec<Arc<dyn Sink>>,
    state: Arc<RwLock<PollerState>>,
}

impl Poller {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        probe: Arc<dyn Probe>,
        sinks: Vec<Arc<dyn Sink>>,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            probe,
            sinks,
            state: Arc::new(RwLock::new(PollerState::Idle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn probe_kind(&self) -> &'static str {
        self.probe.kind()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Time allowed for each of the two phases of a cycle.
    pub fn budget(&self) -> Duration {
        self.interval / 2
    }

    pub async fn state(&self) -> PollerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: PollerState) {
        *self.state.write().await = state;
    }

    /// Poll until `token` is cancelled, or until the probe reports a fault.
    ///
    /// Returns the fault that stopped the check, if any.
    pub async fn run(&self, token: CancellationToken) -> Option<ProbeError> {
        info!(
            check = %self.name,
            probe = self.probe.kind(),
            interval_secs = self.interval.as_secs(),
            sinks = self.sinks.len(),
            "Check started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut fault = None;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let span = info_span!("cycle", check = %self.name, cycle = %Uuid::new_v4());
            match self.run_once(&token).instrument(span).await {
                Cycle::Cancelled => break,
                Cycle::Failed(err) if err.is_fault() => {
                    error!(check = %self.name, error = %err, "Check stopped on fault");
                    fault = Some(err);
                    break;
                }
                Cycle::Passed | Cycle::Failed(_) => {}
            }
        }

        self.set_state(PollerState::Stopped).await;
        info!(check = %self.name, "Check stopped");
        fault
    }

    /// One cycle: check, then report the result unless `token` fired meanwhile.
    pub async fn run_once(&self, token: &CancellationToken) -> Cycle {
        self.set_state(PollerState::Checking).await;
        let result = self.check(token).await;

        if token.is_cancelled() {
            debug!(check = %self.name, "Cancelled during check, skipping sinks");
            self.set_state(PollerState::Idle).await;
            return Cycle::Cancelled;
        }

        match &result {
            Ok(()) => debug!(check = %self.name, "Check passed"),
            Err(err) => warn!(check = %self.name, kind = %err.kind(), error = %err, "Check failed"),
        }

        self.set_state(PollerState::Sinking).await;
        self.sink(token, result.as_ref().err()).await;
        self.set_state(PollerState::Idle).await;

        match result {
            Ok(()) => Cycle::Passed,
            Err(err) => Cycle::Failed(err),
        }
    }

    /// Run the probe under the phase budget. On expiry the probe's token is
    /// cancelled and the probe still gets to return its own error.
    async fn check(&self, token: &CancellationToken) -> Result<(), ProbeError> {
        let probe_token = token.child_token();
        let probe = self.probe.check(probe_token.clone());
        tokio::pin!(probe);

        tokio::select! {
            result = &mut probe => result,
            _ = tokio::time::sleep(self.budget()) => {
                warn!(
                    check = %self.name,
                    budget_ms = self.budget().as_millis() as u64,
                    "Probe exceeded its budget, cancelling"
                );
                probe_token.cancel();
                probe.await
            }
        }
    }

    /// Deliver `failure` to every sink concurrently. Sink errors are logged and
    /// go no further; a sink still running when the budget expires is aborted.
    async fn sink(&self, token: &CancellationToken, failure: Option<&ProbeError>) {
        if self.sinks.is_empty() {
            return;
        }

        let mut group: TaskGroup<Infallible> = TaskGroup::new(token);
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let failure = failure.cloned();
            let check = self.name.clone();
            group.spawn(Policy::NeverCancel, move |token| async move {
                match sink.sink(token, failure.as_ref()).await {
                    Ok(()) => debug!(check = %check, sink = sink.kind(), "Result delivered"),
                    Err(err) => warn!(check = %check, sink = sink.kind(), error = %err, "Sink failed"),
                }
                Ok(())
            });
        }

        // Dropping the group on timeout aborts whatever is still running.
        if tokio::time::timeout(self.budget(), group.wait()).await.is_err() {
            warn!(
                check = %self.name,
                budget_ms = self.budget().as_millis() as u64,
                "Sink phase exceeded its budget"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct Alternating(AtomicUsize);

    #[async_trait]
    impl Probe for Alternating {
        fn kind(&self) -> &'static str {
            "alternating"
        }

        async fn check(&self, _token: CancellationToken) -> Result<(), ProbeError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Ok(())
            } else {
                Err(ProbeError::connection("mx.example.org", "dial", format!("cycle {n}")))
            }
        }
    }

    struct Fixed(Result<(), ProbeError>);

    #[async_trait]
    impl Probe for Fixed {
        fn kind(&self) -> &'static str {
            "fixed"
        }

        async fn check(&self, _token: CancellationToken) -> Result<(), ProbeError> {
            self.0.clone()
        }
    }

    /// Only returns once cancelled.
    struct Hanging;

    #[async_trait]
    impl Probe for Hanging {
        fn kind(&self) -> &'static str {
            "hanging"
        }

        async fn check(&self, token: CancellationToken) -> Result<(), ProbeError> {
            token.cancelled().await;
            Err(ProbeError::connection("hs.example.org", "HEAD", "cancelled before completion"))
        }
    }

    /// Cancels the outer token from inside the check.
    struct Interrupting(CancellationToken);

    #[async_trait]
    impl Probe for Interrupting {
        fn kind(&self) -> &'static str {
            "interrupting"
        }

        async fn check(&self, _token: CancellationToken) -> Result<(), ProbeError> {
            self.0.cancel();
            Err(ProbeError::connection("mx.example.org", "read", "reset"))
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<Option<String>>>);

    impl Recording {
        fn calls(&self) -> Vec<Option<String>> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for Recording {
        fn kind(&self) -> &'static str {
            "recording"
        }

        async fn sink(&self, _token: CancellationToken, failure: Option<&ProbeError>) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(failure.map(|e| e.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Failing(AtomicUsize);

    #[async_trait]
    impl Sink for Failing {
        fn kind(&self) -> &'static str {
            "failing"
        }

        async fn sink(&self, _token: CancellationToken, _failure: Option<&ProbeError>) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Status {
                url: "https://hc-ping.com/x".into(),
                status: 500,
            })
        }
    }

    struct DropTime(Arc<Mutex<Option<Instant>>>);

    impl Drop for DropTime {
        fn drop(&mut self) {
            *self.0.lock().unwrap() = Some(Instant::now());
        }
    }

    /// Never finishes on its own, and ignores its token.
    #[derive(Default)]
    struct Blocking {
        started: AtomicUsize,
        dropped_at: Arc<Mutex<Option<Instant>>>,
    }

    #[async_trait]
    impl Sink for Blocking {
        fn kind(&self) -> &'static str {
            "blocking"
        }

        async fn sink(&self, _token: CancellationToken, _failure: Option<&ProbeError>) -> Result<(), SinkError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _guard = DropTime(Arc::clone(&self.dropped_at));
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn poller(probe: Arc<dyn Probe>, sinks: Vec<Arc<dyn Sink>>) -> Poller {
        Poller::new("mail", Duration::from_secs(10), probe, sinks)
    }

    #[test]
    fn budget_is_half_the_interval() {
        let p = poller(Arc::new(Fixed(Ok(()))), vec![]);
        assert_eq!(p.budget(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn every_cycle_is_sinked_with_its_own_result() {
        let sink = Arc::new(Recording::default());
        let p = Arc::new(poller(
            Arc::new(Alternating(AtomicUsize::new(0))),
            vec![sink.clone() as Arc<dyn Sink>],
        ));

        let token = CancellationToken::new();
        let handle = {
            let p = Arc::clone(&p);
            let token = token.clone();
            tokio::spawn(async move { p.run(token).await })
        };

        // Ticks at 0s, 10s, 20s and 30s.
        tokio::time::sleep(Duration::from_secs(35)).await;
        token.cancel();
        assert!(handle.await.unwrap().is_none());

        let calls = sink.calls();
        assert_eq!(calls.len(), 4, "{calls:?}");
        assert_eq!(calls[0], None);
        assert!(calls[1].as_deref().unwrap().contains("cycle 1"));
        assert_eq!(calls[2], None);
        assert!(calls[3].as_deref().unwrap().contains("cycle 3"));
        assert_eq!(p.state().await, PollerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sink_does_not_cut_short_a_blocking_one() {
        let failing = Arc::new(Failing::default());
        let blocking = Arc::new(Blocking::default());
        let p = poller(
            Arc::new(Fixed(Ok(()))),
            vec![failing.clone() as Arc<dyn Sink>, blocking.clone() as Arc<dyn Sink>],
        );

        let start = Instant::now();
        assert_eq!(p.run_once(&CancellationToken::new()).await, Cycle::Passed);

        assert_eq!(failing.0.load(Ordering::SeqCst), 1);
        assert_eq!(blocking.started.load(Ordering::SeqCst), 1);
        // Aborted tasks are dropped by the scheduler, not inline.
        for _ in 0..16 {
            if blocking.dropped_at.lock().unwrap().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let dropped_at = blocking.dropped_at.lock().unwrap().take().expect("blocking sink aborted");
        assert_eq!(dropped_at - start, p.budget());
        assert_eq!(p.state().await, PollerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_cancelled_at_budget() {
        let sink = Arc::new(Recording::default());
        let p = poller(Arc::new(Hanging), vec![sink.clone() as Arc<dyn Sink>]);

        let start = Instant::now();
        let cycle = p.run_once(&CancellationToken::new()).await;
        assert_eq!(Instant::now() - start, p.budget());
        assert!(matches!(cycle, Cycle::Failed(_)), "{cycle:?}");
        assert_eq!(sink.calls().len(), 1);
        assert!(sink.calls()[0].is_some());
    }

    #[tokio::test]
    async fn cancellation_during_check_skips_sinks() {
        let token = CancellationToken::new();
        let sink = Arc::new(Recording::default());
        let p = poller(
            Arc::new(Interrupting(token.clone())),
            vec![sink.clone() as Arc<dyn Sink>],
        );

        assert_eq!(p.run_once(&token).await, Cycle::Cancelled);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fault_is_reported_then_stops_the_check() {
        let sink = Arc::new(Recording::default());
        let fault = ProbeError::fault("mx.example.org.", "asked for A, answer contained TXT");
        let p = poller(Arc::new(Fixed(Err(fault.clone()))), vec![sink.clone() as Arc<dyn Sink>]);

        let stopped = p.run(CancellationToken::new()).await;
        assert_eq!(stopped, Some(fault));
        assert_eq!(sink.calls().len(), 1);
        assert_eq!(p.state().await, PollerState::Stopped);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_cycle() {
        let sink = Arc::new(Recording::default());
        let p = poller(Arc::new(Fixed(Ok(()))), vec![sink.clone() as Arc<dyn Sink>]);
        let token = CancellationToken::new();
        token.cancel();

        assert!(p.run(token).await.is_none());
        assert!(sink.calls().is_empty());
    }
}
