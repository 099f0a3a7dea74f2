//! Debounced watching of a key-value subtree
//!
//! One background pair per watcher: a fetch task long-polling the prefix and
//! a delivery task coalescing bursts of change notifications. Rapid
//! successive writes collapse into a single downstream update, trading a
//! small fixed latency for far fewer consumer callbacks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{CoordinationClient, KvPair};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::task::TaskHandle;

/// Default minimum idle time after the last change before delivery
pub const DEFAULT_QUIESCENCE_PERIOD: Duration = Duration::from_millis(500);
/// Default maximum time a burst may be held before a forced delivery
pub const DEFAULT_QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(5);
/// Server-side wait bound for one long-poll request
const LONG_POLL_WAIT: Duration = Duration::from_secs(30 * 60);

/// Configuration for a [`SubtreeWatcher`]
pub struct WatcherOptions {
    pub client: Arc<dyn CoordinationClient>,
    /// Key prefix to watch; normalized to end with '/'
    pub prefix: String,
    /// Coalesced snapshots are delivered here
    pub update_tx: mpsc::Sender<Vec<KvPair>>,
    /// Remote errors are forwarded here; discarded when absent
    pub error_tx: Option<mpsc::Sender<Error>>,
    pub quiescence_period: Option<Duration>,
    pub quiescence_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

/// Long-polls a key prefix and delivers debounced snapshots to a consumer
pub struct SubtreeWatcher {
    client: Arc<dyn CoordinationClient>,
    prefix: String,
    update_tx: mpsc::Sender<Vec<KvPair>>,
    error_tx: Option<mpsc::Sender<Error>>,
    quiescence_period: Duration,
    quiescence_timeout: Duration,
    retry: RetryPolicy,

    state: Mutex<Option<TaskHandle>>,
}

impl SubtreeWatcher {
    #[must_use]
    pub fn new(options: WatcherOptions) -> Self {
        Self {
            client: options.client,
            prefix: options.prefix,
            update_tx: options.update_tx,
            error_tx: options.error_tx,
            quiescence_period: options
                .quiescence_period
                .unwrap_or(DEFAULT_QUIESCENCE_PERIOD),
            quiescence_timeout: options
                .quiescence_timeout
                .unwrap_or(DEFAULT_QUIESCENCE_TIMEOUT),
            retry: options.retry,
            state: Mutex::new(None),
        }
    }

    /// Launch the fetch and delivery tasks
    ///
    /// Idempotent: a second call while running returns Ok without spawning
    /// anything. An empty prefix is rejected before any task starts.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        if self.prefix.is_empty() {
            return Err(Error::Configuration("watch prefix cannot be empty".to_string()));
        }
        let mut prefix = self.prefix.clone();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);

        let fetch = tokio::spawn(fetch_loop(
            self.client.clone(),
            prefix,
            self.retry,
            self.error_tx.clone(),
            snapshot_tx,
            cancel.clone(),
        ));
        let delivery = tokio::spawn(delivery_loop(
            snapshot_rx,
            self.update_tx.clone(),
            self.quiescence_period,
            self.quiescence_timeout,
            cancel.clone(),
        ));

        *state = Some(TaskHandle::new(cancel, vec![fetch, delivery]));
        Ok(())
    }

    /// Stop both tasks and wait for them to exit
    ///
    /// Idempotent: returns immediately when not running. A pending backoff
    /// sleep or in-flight long-poll does not delay the stop.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.state.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        handle.stop().await;
        Ok(())
    }
}

/// Forward a remote error to the sink, racing the stop signal
async fn forward_error(
    error_tx: &Option<mpsc::Sender<Error>>,
    cancel: &CancellationToken,
    error: Error,
) {
    let Some(tx) = error_tx else { return };
    tokio::select! {
        () = cancel.cancelled() => {}
        _ = tx.send(error) => {}
    }
}

/// Long-poll the prefix forever, handing each new snapshot to the delivery
/// task
///
/// Remote failures retry with exponential backoff; the stop signal races the
/// call itself and the backoff sleep, so shutdown is never blocked on a
/// pending retry. The default policy retries forever; with a bounded policy
/// the watch stops once the attempts are exhausted, after forwarding the
/// final error. A response whose index matches the last observed one carries
/// no change and is discarded. The index never moves
/// backward within a session; an index replay after a connection reset is
/// indistinguishable from a true no-op and is skipped the same way.
async fn fetch_loop(
    client: Arc<dyn CoordinationClient>,
    prefix: String,
    retry: RetryPolicy,
    error_tx: Option<mpsc::Sender<Error>>,
    snapshot_tx: mpsc::Sender<Vec<KvPair>>,
    cancel: CancellationToken,
) {
    let mut last_index: u64 = 0;

    loop {
        // Delay growth resets after every successful poll
        let mut delays = retry.delays();
        let snapshot = loop {
            if cancel.is_cancelled() {
                return;
            }

            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = client.list_subtree(&prefix, last_index, LONG_POLL_WAIT) => result,
            };

            match result {
                Ok(snapshot) => break snapshot,
                Err(err) => {
                    let Some(delay) = delays.next() else {
                        warn!(
                            prefix = %prefix,
                            error = %err,
                            "retry attempts exhausted, giving up on watch"
                        );
                        forward_error(&error_tx, &cancel, err).await;
                        return;
                    };
                    warn!(
                        prefix = %prefix,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "subtree listing failed, backing off"
                    );
                    forward_error(&error_tx, &cancel, err).await;
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if snapshot.index == last_index {
            continue;
        }
        debug!(
            prefix = %prefix,
            index = snapshot.index,
            pairs = snapshot.pairs.len(),
            "subtree changed"
        );
        last_index = snapshot.index;

        tokio::select! {
            () = cancel.cancelled() => return,
            _ = snapshot_tx.send(snapshot.pairs) => {}
        }
    }
}

/// Sleep until the deadline; disarmed (`None`) timers are never polled
/// because the corresponding select branch is guarded
async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Debounce snapshots: hold the latest one and emit it once per settled burst
///
/// Every arrival, including the first after start, only (re)arms the timers.
/// The quiescence-period timer resets per arrival; the quiescence-timeout
/// timer arms on the first arrival of a burst and never resets, bounding how
/// long continuous churn can starve the consumer.
async fn delivery_loop(
    mut snapshot_rx: mpsc::Receiver<Vec<KvPair>>,
    update_tx: mpsc::Sender<Vec<KvPair>>,
    quiescence_period: Duration,
    quiescence_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut pending: Option<Vec<KvPair>> = None;
    let mut period_deadline: Option<Instant> = None;
    let mut timeout_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            received = snapshot_rx.recv() => {
                let Some(pairs) = received else { return };
                pending = Some(pairs);
                period_deadline = Some(Instant::now() + quiescence_period);
                if timeout_deadline.is_none() {
                    timeout_deadline = Some(Instant::now() + quiescence_timeout);
                }
                continue;
            }
            () = deadline_sleep(period_deadline), if period_deadline.is_some() => {}
            () = deadline_sleep(timeout_deadline), if timeout_deadline.is_some() => {}
        }

        // A timer fired: the burst has settled (or overstayed its welcome)
        period_deadline = None;
        timeout_deadline = None;
        if let Some(pairs) = pending.take() {
            tokio::select! {
                () = cancel.cancelled() => return,
                sent = update_tx.send(pairs) => {
                    if sent.is_err() {
                        warn!("update consumer dropped, stopping delivery");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use crate::client::{KvSnapshot, MockCoordinationClient, ServiceSummary};

    /// One scripted long-poll response: wait `delay`, then resolve
    struct Step {
        delay: Duration,
        result: Result<KvSnapshot>,
    }

    /// Fake KV store replaying a script of long-poll responses; pends forever
    /// once the script is exhausted
    struct FakeKv {
        script: Mutex<VecDeque<Step>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl FakeKv {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                calls: std::sync::atomic::AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CoordinationClient for FakeKv {
        async fn list_subtree(
            &self,
            _prefix: &str,
            _last_index: u64,
            _max_wait: Duration,
        ) -> Result<KvSnapshot> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let step = self.script.lock().pop_front();
            match step {
                Some(step) => {
                    tokio::time::sleep(step.delay).await;
                    step.result
                }
                None => futures::future::pending().await,
            }
        }

        async fn list_services(
            &self,
        ) -> Result<std::collections::HashMap<String, ServiceSummary>> {
            futures::future::pending().await
        }

        async fn register_service(
            &self,
            _descriptor: &crate::client::ServiceDescriptor,
        ) -> Result<()> {
            futures::future::pending().await
        }

        async fn deregister_service(&self, _service_id: &str) -> Result<()> {
            futures::future::pending().await
        }

        async fn update_ttl_check(
            &self,
            _check_id: &str,
            _timestamp: &str,
            _status: crate::client::CheckStatus,
        ) -> Result<()> {
            futures::future::pending().await
        }
    }

    fn pairs(tag: &str) -> Vec<KvPair> {
        vec![KvPair {
            key: format!("config/{tag}"),
            value: tag.as_bytes().to_vec(),
            modify_index: 1,
        }]
    }

    fn ok_step(delay_ms: u64, tag: &str, index: u64) -> Step {
        Step {
            delay: Duration::from_millis(delay_ms),
            result: Ok(KvSnapshot {
                pairs: pairs(tag),
                index,
            }),
        }
    }

    fn watcher(
        client: Arc<dyn CoordinationClient>,
        prefix: &str,
        update_tx: mpsc::Sender<Vec<KvPair>>,
        error_tx: Option<mpsc::Sender<Error>>,
    ) -> SubtreeWatcher {
        SubtreeWatcher::new(WatcherOptions {
            client,
            prefix: prefix.to_string(),
            update_tx,
            error_tx,
            quiescence_period: Some(Duration::from_millis(500)),
            quiescence_timeout: Some(Duration::from_secs(5)),
            retry: RetryPolicy::default(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_single_delivery_of_last_snapshot() {
        // Three arrivals 100ms apart, all inside one quiescence period
        let kv = FakeKv::new(vec![
            ok_step(0, "a", 1),
            ok_step(100, "b", 2),
            ok_step(100, "c", 3),
        ]);
        let (update_tx, mut update_rx) = mpsc::channel(1);
        let watcher = watcher(kv.clone(), "config/", update_tx, None);
        watcher.start().unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(60), update_rx.recv())
            .await
            .expect("delivery expected")
            .expect("channel open");
        assert_eq!(delivered, pairs("c"));

        // The burst settled; nothing further may arrive
        assert!(
            tokio::time::timeout(Duration::from_secs(30), update_rx.recv())
                .await
                .is_err()
        );

        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_snapshot_waits_one_quiescence_period() {
        let kv = FakeKv::new(vec![ok_step(0, "only", 1)]);
        let (update_tx, mut update_rx) = mpsc::channel(1);
        let watcher = watcher(kv, "config/", update_tx, None);

        let started = Instant::now();
        watcher.start().unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(60), update_rx.recv())
            .await
            .expect("delivery expected")
            .expect("channel open");
        assert_eq!(delivered, pairs("only"));
        assert!(started.elapsed() >= Duration::from_millis(500));

        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_churn_delivers_at_quiescence_timeout() {
        // Arrivals every 300ms keep resetting the period timer; the timeout
        // armed at the first arrival forces a delivery
        let steps = (1..=10).map(|i| ok_step(300, &format!("v{i}"), i)).collect();
        let kv = FakeKv::new(steps);
        let (update_tx, mut update_rx) = mpsc::channel(1);
        let watcher = SubtreeWatcher::new(WatcherOptions {
            client: kv,
            prefix: "config/".to_string(),
            update_tx,
            error_tx: None,
            quiescence_period: Some(Duration::from_millis(500)),
            quiescence_timeout: Some(Duration::from_secs(2)),
            retry: RetryPolicy::default(),
        });

        let started = Instant::now();
        watcher.start().unwrap();

        // First arrival at 300ms arms the timeout for 2300ms; arrivals keep
        // coming every 300ms, so the period timer never fires first
        let delivered = tokio::time::timeout(Duration::from_secs(60), update_rx.recv())
            .await
            .expect("delivery expected")
            .expect("channel open");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2300));
        assert!(elapsed < Duration::from_millis(2600));
        // Held snapshot at the timeout boundary is the arrival at 2100ms
        assert_eq!(delivered, pairs("v7"));

        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_index_is_skipped() {
        // Second response replays the same index and must not be delivered
        let kv = FakeKv::new(vec![ok_step(0, "a", 5), ok_step(0, "stale", 5)]);
        let (update_tx, mut update_rx) = mpsc::channel(1);
        let watcher = watcher(kv.clone(), "config/", update_tx, None);
        watcher.start().unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(60), update_rx.recv())
            .await
            .expect("delivery expected")
            .expect("channel open");
        assert_eq!(delivered, pairs("a"));

        assert!(
            tokio::time::timeout(Duration::from_secs(30), update_rx.recv())
                .await
                .is_err()
        );
        // Both scripted responses were consumed plus the final pending call
        assert!(kv.calls() >= 3);

        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_forwarded_and_retried_with_backoff() {
        let kv = FakeKv::new(vec![
            Step {
                delay: Duration::ZERO,
                result: Err(Error::Remote("connection refused".to_string())),
            },
            Step {
                delay: Duration::ZERO,
                result: Err(Error::Remote("connection refused".to_string())),
            },
            ok_step(0, "recovered", 1),
        ]);
        let (update_tx, mut update_rx) = mpsc::channel(1);
        let (error_tx, mut error_rx) = mpsc::channel(8);
        let watcher = watcher(kv, "config/", update_tx, Some(error_tx));
        watcher.start().unwrap();

        let first = tokio::time::timeout(Duration::from_secs(60), error_rx.recv())
            .await
            .expect("error expected")
            .expect("channel open");
        assert!(matches!(first, Error::Remote(_)));

        let delivered = tokio::time::timeout(Duration::from_secs(60), update_rx.recv())
            .await
            .expect("delivery after recovery")
            .expect("channel open");
        assert_eq!(delivered, pairs("recovered"));

        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_long_poll_and_restart() {
        // Script is empty: the first long-poll pends forever
        let kv = FakeKv::new(vec![]);
        let (update_tx, _update_rx) = mpsc::channel(1);
        let watcher = watcher(kv, "config", update_tx, None);

        watcher.start().unwrap();
        watcher.stop().await.unwrap();

        // A fresh task pair spawns cleanly after a stop
        watcher.start().unwrap();
        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_sleep_and_restart() {
        // One scripted error parks the fetch task in its backoff sleep
        let kv = FakeKv::new(vec![Step {
            delay: Duration::ZERO,
            result: Err(Error::Remote("connection refused".to_string())),
        }]);
        let (update_tx, _update_rx) = mpsc::channel(1);
        let watcher = watcher(kv.clone(), "config/", update_tx, None);

        watcher.start().unwrap();
        while kv.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // The error is consumed; the next wakeup is the 1s backoff timer
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Stop must win the race against the pending backoff sleep
        tokio::time::timeout(Duration::from_millis(50), watcher.stop())
            .await
            .expect("stop must not wait out the backoff")
            .unwrap();

        // A fresh fetch task spawns after the stop and polls again
        watcher.start().unwrap();
        while kv.calls() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_policy_gives_up_after_exhaustion() {
        let kv = FakeKv::new(vec![
            Step {
                delay: Duration::ZERO,
                result: Err(Error::Remote("connection refused".to_string())),
            },
            Step {
                delay: Duration::ZERO,
                result: Err(Error::Remote("connection refused".to_string())),
            },
            ok_step(0, "late", 1),
        ]);
        let (update_tx, mut update_rx) = mpsc::channel(1);
        let (error_tx, mut error_rx) = mpsc::channel(8);
        let watcher = SubtreeWatcher::new(WatcherOptions {
            client: kv.clone(),
            prefix: "config/".to_string(),
            update_tx,
            error_tx: Some(error_tx),
            quiescence_period: Some(Duration::from_millis(500)),
            quiescence_timeout: Some(Duration::from_secs(5)),
            retry: RetryPolicy {
                max_times: Some(1),
                ..RetryPolicy::default()
            },
        });
        watcher.start().unwrap();

        // Both failures are forwarded, then the watch gives up
        for _ in 0..2 {
            let err = tokio::time::timeout(Duration::from_secs(60), error_rx.recv())
                .await
                .expect("error expected")
                .expect("channel open");
            assert!(matches!(err, Error::Remote(_)));
        }
        assert!(
            tokio::time::timeout(Duration::from_secs(60), update_rx.recv())
                .await
                .is_err()
        );
        // The scripted recovery response was never requested
        assert_eq!(kv.calls(), 2);

        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_start_is_idempotent() {
        let kv = FakeKv::new(vec![]);
        let (update_tx, _update_rx) = mpsc::channel(1);
        let watcher = watcher(kv.clone(), "config/", update_tx, None);

        watcher.stop().await.unwrap();

        watcher.start().unwrap();
        // Let the fetch task reach its long-poll before poking it again
        while kv.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        watcher.start().unwrap();
        watcher.stop().await.unwrap();
        watcher.stop().await.unwrap();

        // Only the first start spawned a fetch task
        assert_eq!(kv.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_prefix_rejected_before_spawning() {
        let client = Arc::new(MockCoordinationClient::new());
        let (update_tx, _update_rx) = mpsc::channel(1);
        let watcher = watcher(client, "", update_tx, None);

        let err = watcher.start().expect_err("empty prefix must fail");
        assert!(matches!(err, Error::Configuration(_)));

        // And the failed start left the watcher stopped
        watcher.stop().await.unwrap();
    }
}
