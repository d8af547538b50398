//! Probing health checker.
//!
//! One scheduler task per shard emits a probe request every interval,
//! skipping while a probe for that shard is still in flight; a bounded
//! pool of workers executes the probes. Verdict changes pass through a
//! hysteresis stage so a flapping shard pays an increasing number of
//! consecutive good probes before being re-declared alive.

use super::HealthChecker;
use crate::backend::{NodeClient, NodeDialer, Reply};
use crate::config::CheckerOptions;
use crate::error::{Error, Result};
use crate::types::{Shard, ShardStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Flap damping for one shard.
///
/// `delay` is how many consecutive good probes remain before the shard
/// may be re-declared alive; `penalty` is the next value of `delay`,
/// tripled on every dead declaration and capped at ten times the
/// threshold in seconds. Good probes pay both down one step at a time.
struct Hysteresis {
    threshold: Duration,
    emitted: Option<bool>,
    last_alive: Option<Instant>,
    delay: u32,
    penalty: u32,
}

impl Hysteresis {
    fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            emitted: None,
            last_alive: None,
            delay: 1,
            penalty: 2,
        }
    }

    /// Record a good probe. Returns true when an alive transition must
    /// be emitted.
    fn observe_alive(&mut self, now: Instant) -> bool {
        let emit = match self.emitted {
            None => true,
            Some(false) => self.delay == 1,
            Some(true) => false,
        };
        if emit {
            self.emitted = Some(true);
        }
        self.last_alive = Some(now);
        if self.delay > 1 {
            self.delay -= 1;
        }
        if self.penalty > 1 {
            self.penalty -= 1;
        }
        emit
    }

    /// Record a failed probe. Returns true when a dead transition must
    /// be emitted.
    fn observe_dead(&mut self, now: Instant) -> bool {
        let stale = self.emitted == Some(true)
            && self
                .last_alive
                .map_or(true, |t| now.duration_since(t) > self.threshold);
        let emit = self.emitted.is_none() || stale;
        if emit {
            self.delay = self.penalty;
            self.penalty = self.penalty.saturating_mul(3);
            let cap = (self.threshold.as_secs_f64() * 10.0) as u32;
            if cap > 0 && self.penalty > cap {
                self.penalty = cap;
            }
            self.emitted = Some(false);
        }
        emit
    }
}

/// Per-shard probe state shared between its scheduler and whichever
/// worker runs the probe. The in-flight flag is what keeps two workers
/// off the same shard.
struct ProbeContext {
    shard: Shard,
    in_flight: AtomicBool,
    client: Mutex<Option<Box<dyn NodeClient>>>,
    damping: Mutex<Hysteresis>,
}

/// Health checker probing shards directly over the backing protocol.
pub struct LocalChecker {
    options: CheckerOptions,
    dialer: Arc<dyn NodeDialer>,
    state: AtomicU8,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalChecker {
    /// Create a checker; nothing runs until `start`.
    pub fn new(options: CheckerOptions, dialer: Arc<dyn NodeDialer>) -> Self {
        Self {
            options,
            dialer,
            state: AtomicU8::new(STATE_IDLE),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn scheduler(
        ctx: Arc<ProbeContext>,
        jobs: mpsc::Sender<Arc<ProbeContext>>,
        cancel: CancellationToken,
        interval: Duration,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if !ctx.in_flight.swap(true, Ordering::SeqCst) {
                if jobs.send(ctx.clone()).await.is_err() {
                    ctx.in_flight.store(false, Ordering::SeqCst);
                    return;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn worker(
        jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<ProbeContext>>>>,
        updates: mpsc::Sender<ShardStatus>,
        dialer: Arc<dyn NodeDialer>,
        cancel: CancellationToken,
    ) {
        loop {
            let ctx = {
                let mut rx = jobs.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    ctx = rx.recv() => ctx,
                }
            };
            match ctx {
                Some(ctx) => Self::probe(&ctx, &updates, dialer.as_ref(), &cancel).await,
                None => return,
            }
        }
    }

    async fn probe(
        ctx: &ProbeContext,
        updates: &mpsc::Sender<ShardStatus>,
        dialer: &dyn NodeDialer,
        cancel: &CancellationToken,
    ) {
        let alive = Self::ping(ctx, dialer).await;
        let emit = {
            let mut damping = ctx.damping.lock();
            if alive {
                damping.observe_alive(Instant::now())
            } else {
                damping.observe_dead(Instant::now())
            }
        };
        if emit {
            let status = ShardStatus::now(&ctx.shard.addr, alive);
            info!(addr = %status.addr, alive, "shard status transition");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = updates.send(status) => {}
            }
        } else {
            debug!(addr = %ctx.shard.addr, alive, "probe without transition");
        }
        ctx.in_flight.store(false, Ordering::SeqCst);
    }

    /// One liveness round trip. Any transport failure counts as dead,
    /// and a failed client is discarded so the next probe re-dials.
    async fn ping(ctx: &ProbeContext, dialer: &dyn NodeDialer) -> bool {
        // The in-flight flag makes this take/put exclusive.
        let mut client = ctx.client.lock().take();
        if client.is_none() {
            client = dialer.dial(&ctx.shard.addr).await.ok();
        }
        let Some(mut active) = client else {
            return false;
        };
        match active.command("PING", &[]).await {
            Ok(Reply::Simple(ref pong)) if pong == "PONG" => {
                *ctx.client.lock() = Some(active);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl HealthChecker for LocalChecker {
    async fn start(&self, shards: &[Shard]) -> Result<mpsc::Receiver<ShardStatus>> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Config(
                "checker already started; create a new instance".to_string(),
            ));
        }

        let capacity = shards.len().max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<Arc<ProbeContext>>(capacity);
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let (updates_tx, updates_rx) = mpsc::channel::<ShardStatus>(capacity);

        let mut tasks = self.tasks.lock();
        for shard in shards {
            let ctx = Arc::new(ProbeContext {
                shard: shard.clone(),
                in_flight: AtomicBool::new(false),
                client: Mutex::new(None),
                damping: Mutex::new(Hysteresis::new(self.options.threshold)),
            });
            tasks.push(tokio::spawn(Self::scheduler(
                ctx,
                jobs_tx.clone(),
                self.cancel.clone(),
                self.options.interval,
            )));
        }
        for _ in 0..self.options.workers {
            tasks.push(tokio::spawn(Self::worker(
                jobs_rx.clone(),
                updates_tx.clone(),
                self.dialer.clone(),
                self.cancel.clone(),
            )));
        }
        info!(
            shards = shards.len(),
            workers = self.options.workers,
            "health checker started"
        );

        // The clones held by schedulers and workers are now the only
        // senders; when those tasks exit the streams close.
        Ok(updates_rx)
    }

    async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("health checker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn millis(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn first_verdict_is_always_emitted() {
        let mut h = Hysteresis::new(millis(500));
        assert!(h.observe_alive(Instant::now()));

        let mut h = Hysteresis::new(millis(500));
        assert!(h.observe_dead(Instant::now()));
    }

    #[test]
    fn one_bad_probe_does_not_flap_an_up_shard() {
        let mut h = Hysteresis::new(millis(500));
        let t0 = Instant::now();
        assert!(h.observe_alive(t0));
        // A failure inside the threshold window is absorbed.
        assert!(!h.observe_dead(t0 + millis(100)));
        assert!(!h.observe_alive(t0 + millis(200)));
    }

    #[test]
    fn sustained_failure_past_threshold_goes_dead() {
        let mut h = Hysteresis::new(millis(500));
        let t0 = Instant::now();
        assert!(h.observe_alive(t0));
        assert!(!h.observe_dead(t0 + millis(100)));
        assert!(h.observe_dead(t0 + millis(700)));
    }

    #[test]
    fn repromotion_takes_delay_consecutive_good_probes() {
        let mut h = Hysteresis::new(millis(500));
        let t0 = Instant::now();
        assert!(h.observe_alive(t0));
        assert!(h.observe_dead(t0 + millis(600)));
        // First dead declaration took delay = penalty = 2.
        assert_eq!(h.delay, 2);
        // One good probe pays delay down to 1 without emitting.
        assert!(!h.observe_alive(t0 + millis(700)));
        // The probe that sees delay == 1 re-declares alive.
        assert!(h.observe_alive(t0 + millis(800)));
    }

    #[test]
    fn penalty_grows_and_stays_bounded() {
        let threshold = Duration::from_secs(2);
        let cap = 20; // threshold seconds times ten
        let mut h = Hysteresis::new(threshold);
        let mut t = Instant::now();
        assert!(h.observe_dead(t));
        for _ in 0..10 {
            // Re-promote, then knock it down again after the threshold.
            while !h.observe_alive(t) {
                t += millis(100);
            }
            t += Duration::from_secs(3);
            assert!(h.observe_dead(t));
            assert!(h.penalty <= cap, "penalty {} beyond cap", h.penalty);
        }
        assert_eq!(h.penalty, cap);
    }

    #[test]
    fn tiny_thresholds_do_not_wedge_the_counters() {
        let mut h = Hysteresis::new(millis(50));
        let t0 = Instant::now();
        assert!(h.observe_dead(t0));
        assert!(h.penalty >= 1);
        // The shard can still come back.
        let mut t = t0;
        let mut emitted = false;
        for _ in 0..100 {
            t += millis(10);
            if h.observe_alive(t) {
                emitted = true;
                break;
            }
        }
        assert!(emitted);
    }

    async fn recv_status(
        rx: &mut mpsc::Receiver<ShardStatus>,
        deadline: Duration,
    ) -> Option<ShardStatus> {
        tokio::time::timeout(deadline, rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn initial_statuses_are_reported_for_every_shard() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_down("b:1", true);
        let checker = LocalChecker::new(CheckerOptions::fast_for_tests(), backend.clone());
        let shards = vec![Shard::new("a", "a:1"), Shard::new("b", "b:1")];

        let mut rx = checker.start(&shards).await.unwrap();
        let mut seen = std::collections::HashMap::new();
        while seen.len() < 2 {
            let status = recv_status(&mut rx, Duration::from_secs(5))
                .await
                .expect("initial status");
            seen.insert(status.addr.clone(), status.alive);
        }
        assert_eq!(seen.get("a:1"), Some(&true));
        assert_eq!(seen.get("b:1"), Some(&false));
        checker.stop().await;
    }

    #[tokio::test]
    async fn down_transition_arrives_after_threshold() {
        let backend = Arc::new(MemoryBackend::new());
        let checker = LocalChecker::new(CheckerOptions::fast_for_tests(), backend.clone());
        let shards = vec![Shard::new("a", "a:1")];

        let mut rx = checker.start(&shards).await.unwrap();
        let first = recv_status(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert!(first.alive);

        backend.set_down("a:1", true);
        let next = recv_status(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert!(!next.alive);
        assert!(next.since > first.since);
        checker.stop().await;
    }

    #[tokio::test]
    async fn stream_closes_after_stop_and_stop_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let checker = LocalChecker::new(CheckerOptions::fast_for_tests(), backend.clone());
        let mut rx = checker.start(&[Shard::new("a", "a:1")]).await.unwrap();

        checker.stop().await;
        checker.stop().await;

        // Drain whatever was emitted before the stop; the stream must end.
        while let Some(_status) = rx.recv().await {}
    }

    #[tokio::test]
    async fn restart_is_refused() {
        let backend = Arc::new(MemoryBackend::new());
        let checker = LocalChecker::new(CheckerOptions::fast_for_tests(), backend.clone());
        let _rx = checker.start(&[Shard::new("a", "a:1")]).await.unwrap();
        checker.stop().await;
        assert!(checker.start(&[Shard::new("a", "a:1")]).await.is_err());
    }
}
