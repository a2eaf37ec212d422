//! Per-domain scheduling.
//!
//! Each watched domain runs one long-lived task: sleep until the computed
//! next-check instant, take a slot on the shared semaphore, run the
//! classifier with retries, persist the observation, and hand a transition
//! event to the aggregator when the state changed in a user-relevant way.
//!
//! The semaphore lives behind a shared slot so the manager can swap in a new
//! one when the concurrency limit changes. Permits are acquired with
//! `acquire_owned`, which pins the release to the semaphore the permit came
//! from; a swap mid-acquire can never release against the wrong instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, REGISTRAR_UNSUPPORTED};
use crate::config::SharedConfig;
use crate::store::Store;
use crate::{now_local, DomainResult, LifecycleState, TransitionEvent};

/// Callback invoked with the domain name whenever a query begins; the
/// aggregator uses it to track burst activity.
pub type QueryRecorder = Arc<dyn Fn(&str) + Send + Sync>;

/// Swappable handle to the global query semaphore.
pub type SharedSemaphore = Arc<RwLock<Arc<Semaphore>>>;

/// Failed queries are retried on a fixed short interval rather than the
/// configured one, so an outage doesn't park a domain for hours.
const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

/// While sleeping longer than this, the worker re-evaluates its schedule
/// every `RECHECK_TICK` so interval changes apply without a restart.
const RECHECK_THRESHOLD: Duration = Duration::from_secs(10);
const RECHECK_TICK: Duration = Duration::from_secs(10);

pub fn interval_for_state(state: LifecycleState, config_interval: Duration) -> Duration {
    match state {
        LifecycleState::Error => ERROR_RETRY_INTERVAL,
        _ => config_interval,
    }
}

/// Emit-decision for a completed query. Transitions out of `error` and into
/// states nobody wants to hear about stay silent.
pub fn should_emit(
    is_first_query: bool,
    notify: bool,
    old_state: LifecycleState,
    new_state: LifecycleState,
) -> bool {
    if is_first_query || !notify {
        return false;
    }
    if old_state == new_state {
        return false;
    }
    if old_state == LifecycleState::Error {
        return false;
    }
    new_state.should_notify()
}

pub struct DomainWorker {
    domain: String,
    classifier: Arc<Classifier>,
    store: Arc<Store>,
    config: SharedConfig,
    semaphore: SharedSemaphore,
    events: mpsc::Sender<TransitionEvent>,
    notify: bool,
    query_recorder: QueryRecorder,
    cancel: CancellationToken,
    is_first_query: AtomicBool,
}

impl DomainWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domain: &str,
        classifier: Arc<Classifier>,
        store: Arc<Store>,
        config: SharedConfig,
        semaphore: SharedSemaphore,
        events: mpsc::Sender<TransitionEvent>,
        notify: bool,
        query_recorder: QueryRecorder,
        cancel: CancellationToken,
    ) -> Self {
        let domain = domain.trim().to_lowercase();
        // First query if the store has never seen this domain.
        let is_first_query = matches!(store.get_result(&domain), Ok(None) | Err(_));

        DomainWorker {
            domain,
            classifier,
            store,
            config,
            semaphore,
            events,
            notify,
            query_recorder,
            cancel,
            is_first_query: AtomicBool::new(is_first_query),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Scheduler loop. Runs until cancelled.
    pub async fn run(self: Arc<Self>) {
        debug!("worker started for {}", self.domain);

        self.execute_query().await;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let next = self.next_check_time().await;
            let wait = (next - now_local())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!("{} next check at {next} (in {wait:?})", self.domain);

            if wait > RECHECK_THRESHOLD {
                let deadline = Instant::now() + wait;
                let mut ticker = interval_at(Instant::now() + RECHECK_TICK, RECHECK_TICK);

                loop {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            self.execute_query().await;
                            break;
                        }
                        _ = ticker.tick() => {
                            // Interval may have been shortened under us.
                            if self.next_check_time().await <= now_local() {
                                info!("{}: schedule moved up, querying now", self.domain);
                                self.execute_query().await;
                                break;
                            }
                        }
                        _ = self.cancel.cancelled() => {
                            debug!("worker stopped for {}", self.domain);
                            return;
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = sleep(wait) => self.execute_query().await,
                    _ = self.cancel.cancelled() => {
                        debug!("worker stopped for {}", self.domain);
                        return;
                    }
                }
            }
        }
    }

    /// When the next query is due, based on the stored observation and the
    /// current config. Missing or unreadable rows mean "now".
    pub async fn next_check_time(&self) -> DateTime<FixedOffset> {
        let result = match self.store.get_result(&self.domain) {
            Ok(Some(result)) => result,
            Ok(None) => return now_local(),
            Err(e) => {
                debug!("{}: failed to read stored result ({e}), checking now", self.domain);
                return now_local();
            }
        };

        let config_interval = self.config.read().await.check_interval;
        let interval = interval_for_state(result.state, config_interval);
        let interval_chrono = chrono::Duration::from_std(interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(interval.as_secs() as i64));

        let next = result.last_checked + interval_chrono;
        let now = now_local();
        if next <= now {
            return now;
        }
        // A shortened interval moves the deadline up even though `next`
        // (computed from the old write) may still be in the future.
        if now - result.last_checked >= interval_chrono {
            return now;
        }
        next
    }

    async fn execute_query(&self) {
        let started = std::time::Instant::now();

        // Capture the current semaphore before acquiring; the owned permit
        // keeps its own reference for release.
        let semaphore = self.semaphore.read().await.clone();
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return, // semaphore closed, shutting down
            },
            _ = self.cancel.cancelled() => return,
        };

        (self.query_recorder)(&self.domain);
        info!("{}: query started", self.domain);

        let previous_state = match self.store.get_result(&self.domain) {
            Ok(Some(result)) => result.state,
            _ => LifecycleState::Unknown,
        };

        // Cancellation mid-query drops the in-flight future, which closes
        // the underlying connection.
        let result = tokio::select! {
            result = self.classifier.check_with_retry(&self.domain, &self.cancel) => result,
            _ = self.cancel.cancelled() => return,
        };
        let result = finalize_for_save(result);

        match self.store.save_result(&result) {
            Ok(true) => {}
            Ok(false) => {
                debug!("{}: stale result discarded", self.domain);
                return;
            }
            Err(e) => {
                // Without a persisted row there is nothing to notify about.
                warn!("{}: failed to persist result: {e}", self.domain);
                return;
            }
        }

        let first = self.is_first_query.swap(false, Ordering::SeqCst);
        if first {
            info!(
                "{}: first query done, state {} (no notification)",
                self.domain, result.state
            );
        } else if should_emit(false, self.notify, previous_state, result.state) {
            let event = TransitionEvent::new(
                &self.domain,
                previous_state,
                result.state,
                Some(result.clone()),
            );
            if let Err(e) = self.events.try_send(event) {
                warn!("{}: transition queue full, dropping event ({e})", self.domain);
            }
        }

        info!(
            "{}: query finished, state {} ({:?})",
            self.domain,
            result.state,
            started.elapsed()
        );
    }
}

/// Normalization applied just before persisting: a registered-ish result
/// with no registrar gets the "not published" marker so the column reads as
/// an answer, not a gap.
pub fn finalize_for_save(mut result: DomainResult) -> DomainResult {
    let suppress = matches!(
        result.state,
        LifecycleState::Available | LifecycleState::Error | LifecycleState::Unknown
    );
    if result.registrar.is_empty() && !suppress {
        result.registrar = REGISTRAR_UNSUPPORTED.to_string();
    }
    result
}

struct WorkerHandle {
    worker: Arc<DomainWorker>,
    task: JoinHandle<()>,
}

/// Owns every per-domain worker plus the shared semaphore they throttle on.
pub struct WorkerManager {
    workers: tokio::sync::Mutex<HashMap<String, WorkerHandle>>,
    classifier: Arc<Classifier>,
    store: Arc<Store>,
    config: SharedConfig,
    semaphore: SharedSemaphore,
    events: mpsc::Sender<TransitionEvent>,
    query_recorder: QueryRecorder,
    root_cancel: CancellationToken,
}

impl WorkerManager {
    pub fn new(
        classifier: Arc<Classifier>,
        store: Arc<Store>,
        config: SharedConfig,
        concurrent_limit: usize,
        events: mpsc::Sender<TransitionEvent>,
        query_recorder: QueryRecorder,
    ) -> Self {
        let limit = concurrent_limit.max(1);
        WorkerManager {
            workers: tokio::sync::Mutex::new(HashMap::new()),
            classifier,
            store,
            config,
            semaphore: Arc::new(RwLock::new(Arc::new(Semaphore::new(limit)))),
            events,
            query_recorder,
            root_cancel: CancellationToken::new(),
        }
    }

    /// Create and start a worker if one is not already running. Idempotent.
    pub async fn add(&self, domain: &str, notify: bool) {
        let domain = domain.trim().to_lowercase();
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&domain) {
            debug!("worker for {domain} already running");
            return;
        }

        let worker = Arc::new(DomainWorker::new(
            &domain,
            self.classifier.clone(),
            self.store.clone(),
            self.config.clone(),
            self.semaphore.clone(),
            self.events.clone(),
            notify,
            self.query_recorder.clone(),
            self.root_cancel.child_token(),
        ));
        let task = tokio::spawn(worker.clone().run());
        workers.insert(domain.clone(), WorkerHandle { worker, task });
        info!("worker started for {domain}");
    }

    pub async fn remove(&self, domain: &str) {
        let domain = domain.trim().to_lowercase();
        let mut workers = self.workers.lock().await;
        if let Some(handle) = workers.remove(&domain) {
            handle.worker.cancel_token().cancel();
            handle.task.abort();
            info!("worker stopped for {domain}");
        }
    }

    pub async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        let count = workers.len();
        for (_, handle) in workers.drain() {
            handle.worker.cancel_token().cancel();
        }
        info!("stopped all workers ({count})");
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Swap in a fresh semaphore with the new capacity. Queries already
    /// holding (or waiting on) permits finish against the old semaphore;
    /// everything after observes the new limit.
    pub async fn update_concurrency_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let fresh = Arc::new(Semaphore::new(limit));
        *self.semaphore.write().await = fresh;
        info!("concurrency limit updated to {limit}");
    }

    /// Push a new config snapshot. Workers pick it up lazily at their next
    /// scheduling decision; the semaphore is resized here as well.
    pub async fn update_config(&self, config: crate::config::MonitorConfig) {
        let limit = config.concurrent_limit;
        *self.config.write().await = config;
        self.update_concurrency_limit(limit).await;
    }

    pub(crate) fn semaphore(&self) -> SharedSemaphore {
        self.semaphore.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::{QueryMethod, Store};

    #[test]
    fn error_state_uses_the_fixed_retry_interval() {
        let base = Duration::from_secs(600);
        assert_eq!(
            interval_for_state(LifecycleState::Error, base),
            Duration::from_secs(3600)
        );
        for state in [
            LifecycleState::Available,
            LifecycleState::Registered,
            LifecycleState::Grace,
            LifecycleState::Redemption,
            LifecycleState::PendingDelete,
            LifecycleState::Unknown,
        ] {
            assert_eq!(interval_for_state(state, base), base);
        }
    }

    #[test]
    fn emit_decision_table() {
        use LifecycleState::*;

        // First query never emits.
        assert!(!should_emit(true, true, Registered, PendingDelete));
        // Notifications disabled for the domain.
        assert!(!should_emit(false, false, Registered, PendingDelete));
        // No change.
        assert!(!should_emit(false, true, Registered, Registered));
        // Recovery from error is not user-visible.
        assert!(!should_emit(false, true, Error, Available));
        // Transition into a non-notifying state.
        assert!(!should_emit(false, true, Grace, Registered));
        // The cases that do fire.
        assert!(should_emit(false, true, Registered, PendingDelete));
        assert!(should_emit(false, true, Registered, Redemption));
        assert!(should_emit(false, true, Registered, Available));
        assert!(should_emit(false, true, PendingDelete, Available));
    }

    #[test]
    fn registrar_marker_only_for_registered_like_states() {
        let mut result = DomainResult::error("x.example.com", "boom");
        result.state = LifecycleState::Registered;
        let finalized = finalize_for_save(result);
        assert_eq!(finalized.registrar, REGISTRAR_UNSUPPORTED);

        for state in [
            LifecycleState::Available,
            LifecycleState::Error,
            LifecycleState::Unknown,
        ] {
            let mut result = DomainResult::error("x.example.com", "boom");
            result.state = state;
            assert!(finalize_for_save(result).registrar.is_empty());
        }

        // An extracted registrar is never overwritten.
        let mut result = DomainResult::error("x.example.com", "");
        result.state = LifecycleState::Registered;
        result.registrar = "Real Registrar".to_string();
        assert_eq!(finalize_for_save(result).registrar, "Real Registrar");
    }

    fn test_worker(store: Arc<Store>, domain: &str) -> DomainWorker {
        let config = MonitorConfig::default().into_shared();
        let classifier = Arc::new(Classifier::new(config.clone()).unwrap());
        let (tx, _rx) = mpsc::channel(16);
        DomainWorker::new(
            domain,
            classifier,
            store,
            config,
            Arc::new(RwLock::new(Arc::new(Semaphore::new(1)))),
            tx,
            true,
            Arc::new(|_| {}),
            CancellationToken::new(),
        )
    }

    fn stored_result(domain: &str, state: LifecycleState, age: chrono::Duration) -> DomainResult {
        DomainResult {
            domain: domain.to_string(),
            state,
            registrar: String::new(),
            last_checked: now_local() - age,
            query_method: QueryMethod::Whois,
            created_at: None,
            expiry_at: None,
            updated_at: None,
            name_servers: Vec::new(),
            raw: "raw".to_string(),
            error_message: String::new(),
        }
    }

    #[tokio::test]
    async fn next_check_is_now_without_history() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let worker = test_worker(store, "new.example.com");
        let next = worker.next_check_time().await;
        assert!((next - now_local()).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn next_check_is_scheduled_from_last_checked() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let result = stored_result(
            "fresh.example.com",
            LifecycleState::Registered,
            chrono::Duration::seconds(0),
        );
        store.save_result(&result).unwrap();

        let worker = test_worker(store, "fresh.example.com");
        let next = worker.next_check_time().await;
        let expected = result.last_checked + chrono::Duration::seconds(1800);
        assert!((next - expected).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn overdue_result_checks_immediately() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .save_result(&stored_result(
                "overdue.example.com",
                LifecycleState::Registered,
                chrono::Duration::hours(2),
            ))
            .unwrap();

        let worker = test_worker(store, "overdue.example.com");
        let next = worker.next_check_time().await;
        assert!((next - now_local()).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn first_query_flag_follows_stored_history() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let worker = test_worker(store.clone(), "unseen.example.com");
        assert!(worker.is_first_query.load(Ordering::SeqCst));

        store
            .save_result(&stored_result(
                "seen.example.com",
                LifecycleState::Registered,
                chrono::Duration::seconds(10),
            ))
            .unwrap();
        let worker = test_worker(store, "seen.example.com");
        assert!(!worker.is_first_query.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn manager_add_is_idempotent_and_remove_unmaps() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = MonitorConfig::default().into_shared();
        let classifier = Arc::new(Classifier::new(config.clone()).unwrap());
        let (tx, _rx) = mpsc::channel(16);
        let manager = WorkerManager::new(
            classifier,
            store,
            config,
            2,
            tx,
            Arc::new(|_| {}),
        );

        manager.add("Dup.Example.COM", true).await;
        manager.add("dup.example.com", true).await;
        assert_eq!(manager.worker_count().await, 1);

        manager.remove("dup.example.com").await;
        assert_eq!(manager.worker_count().await, 0);

        manager.add("a.example.com", true).await;
        manager.add("b.example.com", true).await;
        assert_eq!(manager.worker_count().await, 2);
        manager.stop_all().await;
        assert_eq!(manager.worker_count().await, 0);
    }

    #[tokio::test]
    async fn concurrency_swap_replaces_the_semaphore() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = MonitorConfig::default().into_shared();
        let classifier = Arc::new(Classifier::new(config.clone()).unwrap());
        let (tx, _rx) = mpsc::channel(16);
        let manager = WorkerManager::new(
            classifier,
            store,
            config,
            2,
            tx,
            Arc::new(|_| {}),
        );

        let before = manager.semaphore().read().await.clone();
        assert_eq!(before.available_permits(), 2);

        // Zero is coerced to one.
        manager.update_concurrency_limit(0).await;
        let after = manager.semaphore().read().await.clone();
        assert_eq!(after.available_permits(), 1);
        assert!(!Arc::ptr_eq(&before, &after));

        // A permit taken from the old semaphore releases against it, not
        // the replacement.
        let old_permit = before.clone().acquire_owned().await.unwrap();
        assert_eq!(before.available_permits(), 1);
        drop(old_permit);
        assert_eq!(before.available_permits(), 2);
        assert_eq!(after.available_permits(), 1);
    }
}
