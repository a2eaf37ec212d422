//! Engine facade.
//!
//! Wires the classifier, store, worker manager, aggregator and notification
//! manager together and exposes the operations external surfaces consume:
//! start/stop, add/remove domain, force check, stats.
//!
//! Construction is leaves-first: notification manager, then aggregator
//! (which hands out the event channel and the query recorder), then the
//! worker manager that feeds them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::classifier::Classifier;
use crate::config::{MonitorConfig, SharedConfig};
use crate::errors::MonitorError;
use crate::notify::{NotificationManager, Notifier};
use crate::store::Store;
use crate::tld::TldRegistry;
use crate::worker::{finalize_for_save, QueryRecorder, WorkerManager};
use crate::{DomainResult, LifecycleState, TransitionEvent};

#[derive(Debug, Clone)]
pub struct MonitorStats {
    pub running: bool,
    pub domain_count: usize,
    pub worker_count: usize,
    pub uptime: Duration,
    pub state_counts: HashMap<LifecycleState, usize>,
}

pub struct Monitor {
    classifier: Arc<Classifier>,
    config: SharedConfig,
    store: Arc<Store>,
    workers: WorkerManager,
    aggregator: Aggregator,
    notifications: Arc<NotificationManager>,
    events: mpsc::Sender<TransitionEvent>,
    query_recorder: QueryRecorder,
    running: AtomicBool,
    started_at: Instant,
    root_cancel: CancellationToken,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        store: Arc<Store>,
        notifiers: Vec<Arc<dyn Notifier>>,
    ) -> Result<Self, MonitorError> {
        let config = config.clamped();
        let concurrent_limit = config.concurrent_limit;
        let shared = config.into_shared();

        let classifier = Arc::new(Classifier::new(shared.clone())?);
        let notifications = NotificationManager::start(notifiers);
        let aggregator = Aggregator::start(store.clone(), notifications.clone());
        let events = aggregator.sender();
        let query_recorder = aggregator.recorder();

        let workers = WorkerManager::new(
            classifier.clone(),
            store.clone(),
            shared.clone(),
            concurrent_limit,
            events.clone(),
            query_recorder.clone(),
        );

        Ok(Monitor {
            classifier,
            config: shared,
            store,
            workers,
            aggregator,
            notifications,
            events,
            query_recorder,
            running: AtomicBool::new(false),
            started_at: Instant::now(),
            root_cancel: CancellationToken::new(),
        })
    }

    /// Spin up workers for every enabled domain. Idempotent.
    pub async fn start(&self) -> Result<(), MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.store.clean_orphaned() {
            warn!("orphan cleanup failed: {e}");
        }

        let entries = self.store.list_domains(true)?;
        let mut valid = 0usize;
        for entry in &entries {
            if let Err(e) = validate_domain(&entry.name) {
                warn!("skipping invalid watched domain {}: {e}", entry.name);
                continue;
            }
            self.workers.add(&entry.name, entry.notify).await;
            valid += 1;
        }

        info!(
            "monitor started with {valid} domain(s), concurrency {}",
            self.config.read().await.concurrent_limit
        );
        Ok(())
    }

    /// Stop every worker, then flush and stop the notification pipeline.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.root_cancel.cancel();
        self.workers.stop_all().await;
        self.aggregator.stop().await;
        self.notifications.stop().await;
        info!("monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate, persist and (when running) start watching a domain.
    pub async fn add_domain(&self, name: &str, notify: bool) -> Result<(), MonitorError> {
        let normalized = validate_domain(name)?;
        self.store.add_domain(&normalized, true, notify)?;
        if self.is_running() {
            self.workers.add(&normalized, notify).await;
        }
        Ok(())
    }

    /// Stop watching a domain and delete everything recorded about it.
    pub async fn remove_domain(&self, name: &str) -> Result<(), MonitorError> {
        let normalized = name.trim().to_lowercase();
        self.workers.remove(&normalized).await;
        self.store.remove_domain(&normalized)?;
        Ok(())
    }

    /// Synchronous on-demand check, bypassing the schedule. Runs the same
    /// retrying query and transition logic a worker would, persists, and
    /// returns the fresh observation.
    pub async fn force_check(&self, name: &str) -> Result<DomainResult, MonitorError> {
        let domain = validate_domain(name)?;
        info!("force check for {domain}");

        (self.query_recorder)(&domain);

        let previous_state = match self.store.get_result(&domain)? {
            Some(result) => result.state,
            None => LifecycleState::Unknown,
        };

        let result = self
            .classifier
            .check_with_retry(&domain, &self.root_cancel)
            .await;
        let result = finalize_for_save(result);
        self.store.save_result(&result)?;

        if previous_state != LifecycleState::Unknown
            && previous_state != LifecycleState::Error
            && previous_state != result.state
            && result.state.should_notify()
        {
            info!("{domain}: {previous_state} -> {} (force check)", result.state);
            let event = TransitionEvent::new(
                &domain,
                previous_state,
                result.state,
                Some(result.clone()),
            );
            if self.events.try_send(event).is_err() {
                warn!("{domain}: transition queue full, dropping force-check event");
            }
        }

        Ok(result)
    }

    /// Last stored observation for a domain, if any.
    pub fn last_result(&self, name: &str) -> Result<Option<DomainResult>, MonitorError> {
        self.store.get_result(name)
    }

    pub fn all_results(&self) -> Result<Vec<DomainResult>, MonitorError> {
        self.store.load_results()
    }

    /// Apply a new configuration: clamped, pushed to workers (who observe
    /// it at their next scheduling decision) and to the semaphore.
    pub async fn update_config(&self, config: MonitorConfig) {
        let config = config.clamped();
        info!(
            "config update: interval {:?}, concurrency {}, timeout {:?}",
            config.check_interval, config.concurrent_limit, config.timeout
        );
        self.workers.update_config(config).await;
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.notifications
    }

    pub async fn stats(&self) -> Result<MonitorStats, MonitorError> {
        let mut state_counts: HashMap<LifecycleState, usize> = HashMap::new();
        for result in self.store.load_results()? {
            *state_counts.entry(result.state).or_insert(0) += 1;
        }

        Ok(MonitorStats {
            running: self.is_running(),
            domain_count: self.store.list_domains(true)?.len(),
            worker_count: self.workers.worker_count().await,
            uptime: self.started_at.elapsed(),
            state_counts,
        })
    }
}

/// Strict domain syntax check plus TLD support. Returns the normalized
/// (trimmed, lowercased) name.
pub fn validate_domain(name: &str) -> Result<String, MonitorError> {
    let domain = name.trim().to_lowercase();

    if domain.is_empty() {
        return Err(MonitorError::InvalidDomain("domain is empty".into()));
    }
    if domain.len() > 253 {
        return Err(MonitorError::InvalidDomain(
            "domain exceeds 253 characters".into(),
        ));
    }
    if let Some(bad) = domain
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-')
    {
        return Err(MonitorError::InvalidDomain(format!(
            "invalid character {bad:?}"
        )));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(MonitorError::InvalidDomain(
            "domain needs at least two labels".into(),
        ));
    }
    for (i, label) in labels.iter().enumerate() {
        if label.is_empty() {
            return Err(MonitorError::InvalidDomain("empty label".into()));
        }
        if label.len() > 63 {
            return Err(MonitorError::InvalidDomain(format!(
                "label {label:?} exceeds 63 characters"
            )));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(MonitorError::InvalidDomain(format!(
                "label {label:?} starts or ends with a hyphen"
            )));
        }
        if i == labels.len() - 1 && label.chars().all(|c| c.is_ascii_digit()) {
            return Err(MonitorError::InvalidDomain(
                "top-level label cannot be all digits".into(),
            ));
        }
    }

    if !TldRegistry::global().is_supported(&domain) {
        let tld = labels.last().copied().unwrap_or_default();
        return Err(MonitorError::UnsupportedTld(tld.to_string()));
    }

    Ok(domain)
}
