//! Transition batching.
//!
//! Checks across a fleet of domains arrive in bursts, so transitions are
//! grouped before delivery: the first event of a group arms a 10-second
//! window, and an 8-second idle watcher flushes early once no worker has
//! started a query for that long. One pending event flushes as a single
//! notification, several flush as one batched notification.
//!
//! The aggregator is also the restart-dedup gate: before admitting an
//! event it consults the persisted notification log and drops transitions
//! the user has already been told about.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::notify::NotificationManager;
use crate::store::Store;
use crate::worker::QueryRecorder;
use crate::{LifecycleState, TransitionEvent};

/// Upper bound on group latency.
const GROUP_WINDOW: Duration = Duration::from_secs(10);
/// A burst is considered over after this long without a new query starting.
const IDLE_CUTOFF: Duration = Duration::from_secs(8);

const EVENT_QUEUE_CAPACITY: usize = 1000;

pub struct Aggregator {
    tx: mpsc::Sender<TransitionEvent>,
    last_query_at: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Aggregator {
    /// Spawn the consumer loop.
    pub fn start(store: Arc<Store>, manager: Arc<NotificationManager>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let last_query_at = Arc::new(Mutex::new(Instant::now()));
        let cancel = CancellationToken::new();

        let consumer = Consumer {
            store,
            manager,
            last_query_at: last_query_at.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(consumer.run(rx));

        Aggregator {
            tx,
            last_query_at,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Channel end handed to workers; submissions must never block, so
    /// callers use `try_send` and drop on overflow.
    pub fn sender(&self) -> mpsc::Sender<TransitionEvent> {
        self.tx.clone()
    }

    /// Callback for workers to report "query started", feeding the idle
    /// watcher.
    pub fn recorder(&self) -> QueryRecorder {
        let last_query_at = self.last_query_at.clone();
        Arc::new(move |_domain: &str| {
            *last_query_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        })
    }

    /// Stop the consumer; pending events are flushed before it exits.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        info!("aggregator stopped");
    }
}

struct Consumer {
    store: Arc<Store>,
    manager: Arc<NotificationManager>,
    last_query_at: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl Consumer {
    async fn run(self, mut rx: mpsc::Receiver<TransitionEvent>) {
        let mut pending: Vec<TransitionEvent> = Vec::new();
        let mut group_deadline: Option<Instant> = None;
        let mut idle_deadline: Option<Instant> = None;

        // Deadline placeholders keep the select arms alive when disarmed;
        // the `if` guards make sure a placeholder never fires.
        let far = || Instant::now() + Duration::from_secs(86400);

        loop {
            let group_sleep = sleep_until(group_deadline.unwrap_or_else(far));
            let idle_sleep = sleep_until(idle_deadline.unwrap_or_else(far));
            tokio::pin!(group_sleep, idle_sleep);

            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => {
                        self.handle_event(event, &mut pending, &mut group_deadline, &mut idle_deadline);
                    }
                    None => {
                        self.flush(&mut pending, &mut group_deadline, &mut idle_deadline);
                        return;
                    }
                },
                _ = &mut group_sleep, if group_deadline.is_some() => {
                    debug!("group window elapsed, flushing {} event(s)", pending.len());
                    self.flush(&mut pending, &mut group_deadline, &mut idle_deadline);
                },
                _ = &mut idle_sleep, if idle_deadline.is_some() => {
                    // One-shot: the watcher checks once per group.
                    idle_deadline = None;
                    let idle_for = self
                        .last_query_at
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .elapsed();
                    if !pending.is_empty() && idle_for >= IDLE_CUTOFF {
                        info!(
                            "no new queries for {idle_for:?}, flushing {} event(s) early",
                            pending.len()
                        );
                        self.flush(&mut pending, &mut group_deadline, &mut idle_deadline);
                    }
                },
                _ = self.cancel.cancelled() => {
                    // Drain submissions that raced with shutdown, then
                    // flush synchronously.
                    while let Ok(event) = rx.try_recv() {
                        self.handle_event(event, &mut pending, &mut group_deadline, &mut idle_deadline);
                    }
                    self.flush(&mut pending, &mut group_deadline, &mut idle_deadline);
                    return;
                }
            }
        }
    }

    fn handle_event(
        &self,
        event: TransitionEvent,
        pending: &mut Vec<TransitionEvent>,
        group_deadline: &mut Option<Instant>,
        idle_deadline: &mut Option<Instant>,
    ) {
        // A first observation or a failed classification is not a
        // transition.
        if event.old_state == LifecycleState::Unknown {
            debug!("{}: no prior state, not a transition", event.domain);
            return;
        }
        if event.old_state == event.new_state {
            debug!("{}: state unchanged ({}), skipping", event.domain, event.new_state);
            return;
        }

        // Restart dedup: the log survives the process, the pending list
        // does not.
        match self.store.get_last_notification(&event.domain) {
            Ok(Some(record))
                if record.state == event.new_state
                    && record.old_state == Some(event.old_state) =>
            {
                info!(
                    "{}: transition {} -> {} already notified, skipping",
                    event.domain, event.old_state, event.new_state
                );
                return;
            }
            Ok(_) => {}
            Err(e) => error!("failed to read notification log: {e}"),
        }

        if pending.is_empty() {
            info!(
                "new notification group: {} ({} -> {})",
                event.domain, event.old_state, event.new_state
            );
            pending.push(event);
            *group_deadline = Some(Instant::now() + GROUP_WINDOW);
            *idle_deadline = Some(Instant::now() + IDLE_CUTOFF);
            return;
        }

        if pending.iter().any(|e| e.domain == event.domain) {
            debug!("{}: already in the current group", event.domain);
            return;
        }
        info!(
            "{} joins the notification group ({} -> {}), group size {}",
            event.domain,
            event.old_state,
            event.new_state,
            pending.len() + 1
        );
        pending.push(event);
    }

    fn flush(
        &self,
        pending: &mut Vec<TransitionEvent>,
        group_deadline: &mut Option<Instant>,
        idle_deadline: &mut Option<Instant>,
    ) {
        *group_deadline = None;
        *idle_deadline = None;

        if pending.is_empty() {
            return;
        }

        // The log write comes first: a crash between persisting and
        // delivering errs on the side of not pestering the user again.
        for event in pending.iter() {
            if let Err(e) =
                self.store
                    .save_notification(&event.domain, event.new_state, event.old_state)
            {
                error!("{}: failed to persist notification record: {e}", event.domain);
            }
        }

        if pending.len() == 1 {
            let event = pending.remove(0);
            self.manager.dispatch_single(event);
        } else {
            self.manager.dispatch_batch(std::mem::take(pending));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::MonitorError;
    use async_trait::async_trait;

    struct CaptureSink {
        messages: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl Notifier for CaptureSink {
        async fn send(&self, subject: &str, body: &str) -> Result<(), MonitorError> {
            self.messages
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
            Ok(())
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn kind(&self) -> &'static str {
            "capture"
        }
        async fn test(&self) -> Result<(), MonitorError> {
            Ok(())
        }
    }

    struct Rig {
        store: Arc<Store>,
        aggregator: Aggregator,
        manager: Arc<NotificationManager>,
        messages: Arc<Mutex<Vec<(String, String)>>>,
    }

    fn rig() -> Rig {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let messages = Arc::new(Mutex::new(Vec::new()));
        let manager = NotificationManager::start(vec![Arc::new(CaptureSink {
            messages: messages.clone(),
        }) as Arc<dyn Notifier>]);
        let aggregator = Aggregator::start(store.clone(), manager.clone());
        Rig {
            store,
            aggregator,
            manager,
            messages,
        }
    }

    fn transition(domain: &str, old: LifecycleState, new: LifecycleState) -> TransitionEvent {
        TransitionEvent::new(domain, old, new, None)
    }

    async fn wait_for_messages(
        messages: &Arc<Mutex<Vec<(String, String)>>>,
        count: usize,
    ) -> Vec<(String, String)> {
        for _ in 0..200 {
            {
                let msgs = messages.lock().unwrap();
                if msgs.len() >= count {
                    return msgs.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        messages.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn single_event_flushes_as_single_after_group_window() {
        let rig = rig();
        rig.aggregator
            .sender()
            .try_send(transition(
                "solo.example",
                LifecycleState::Registered,
                LifecycleState::Redemption,
            ))
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        let messages = wait_for_messages(&rig.messages, 1).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "solo.example entered redemption");
        assert!(rig
            .store
            .has_notified("solo.example", LifecycleState::Redemption)
            .unwrap());

        rig.aggregator.stop().await;
        rig.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_flushes_as_one_batch_with_all_records() {
        let rig = rig();
        let domains = [
            "one.example",
            "two.example",
            "three.example",
            "four.example",
            "five.example",
        ];
        for domain in domains {
            rig.aggregator
                .sender()
                .try_send(transition(
                    domain,
                    LifecycleState::Registered,
                    LifecycleState::Redemption,
                ))
                .unwrap();
        }

        // The idle watcher fires at 8s; with no queries recorded it
        // flushes before the 10s group window.
        tokio::time::advance(Duration::from_secs(9)).await;

        let messages = wait_for_messages(&rig.messages, 1).await;
        assert_eq!(messages.len(), 1, "expected one batched notification");
        assert_eq!(messages[0].0, "Domain status changes (5 domains)");
        // Insertion order is preserved in the body.
        let body = &messages[0].1;
        let positions: Vec<usize> = domains.iter().map(|d| body.find(d).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        for domain in domains {
            assert!(rig.store.has_notified(domain, LifecycleState::Redemption).unwrap());
        }

        rig.aggregator.stop().await;
        rig.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn same_domain_collapses_within_a_group() {
        let rig = rig();
        let sender = rig.aggregator.sender();
        sender
            .try_send(transition(
                "dup.example",
                LifecycleState::Registered,
                LifecycleState::Redemption,
            ))
            .unwrap();
        sender
            .try_send(transition(
                "dup.example",
                LifecycleState::Registered,
                LifecycleState::PendingDelete,
            ))
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        let messages = wait_for_messages(&rig.messages, 1).await;
        // Collapsed to one pending entry, so it flushes as a single.
        assert_eq!(messages.len(), 1);
        assert!(messages[0].0.contains("dup.example"));

        rig.aggregator.stop().await;
        rig.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_transition_across_restart_is_dropped() {
        let rig = rig();
        // Simulates the pre-restart process having notified already.
        rig.store
            .save_notification(
                "seen.example",
                LifecycleState::Redemption,
                LifecycleState::Registered,
            )
            .unwrap();

        rig.aggregator
            .sender()
            .try_send(transition(
                "seen.example",
                LifecycleState::Registered,
                LifecycleState::Redemption,
            ))
            .unwrap();

        tokio::time::advance(Duration::from_secs(12)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rig.messages.lock().unwrap().is_empty());

        rig.aggregator.stop().await;
        rig.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn returning_to_an_earlier_state_fires_again() {
        let rig = rig();
        // Last notified transition was grace -> redemption; the domain now
        // goes redemption -> grace, which is a different pair and must fire.
        rig.store
            .save_notification("back.example", LifecycleState::Redemption, LifecycleState::Grace)
            .unwrap();

        rig.aggregator
            .sender()
            .try_send(transition(
                "back.example",
                LifecycleState::Redemption,
                LifecycleState::Grace,
            ))
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        let messages = wait_for_messages(&rig.messages, 1).await;
        assert_eq!(messages.len(), 1);

        rig.aggregator.stop().await;
        rig.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_observation_and_no_change_events_are_dropped() {
        let rig = rig();
        let sender = rig.aggregator.sender();
        sender
            .try_send(transition(
                "first.example",
                LifecycleState::Unknown,
                LifecycleState::Available,
            ))
            .unwrap();
        sender
            .try_send(transition(
                "same.example",
                LifecycleState::Redemption,
                LifecycleState::Redemption,
            ))
            .unwrap();

        tokio::time::advance(Duration::from_secs(12)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rig.messages.lock().unwrap().is_empty());
        assert!(!rig
            .store
            .has_notified("first.example", LifecycleState::Available)
            .unwrap());

        rig.aggregator.stop().await;
        rig.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recent_query_activity_defers_the_idle_flush() {
        let rig = rig();
        let recorder = rig.aggregator.recorder();

        rig.aggregator
            .sender()
            .try_send(transition(
                "busy.example",
                LifecycleState::Registered,
                LifecycleState::Redemption,
            ))
            .unwrap();

        // Keep queries flowing: at 7s the idle watcher will see recent
        // activity and stand down; the group window still fires at 10s.
        tokio::time::advance(Duration::from_secs(7)).await;
        recorder("other.example");
        tokio::time::advance(Duration::from_secs(2)).await;
        {
            let msgs = rig.messages.lock().unwrap();
            assert!(msgs.is_empty(), "idle path must not fire with recent queries");
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        let messages = wait_for_messages(&rig.messages, 1).await;
        assert_eq!(messages.len(), 1);

        rig.aggregator.stop().await;
        rig.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_events() {
        let rig = rig();
        rig.aggregator
            .sender()
            .try_send(transition(
                "late.example",
                LifecycleState::Registered,
                LifecycleState::PendingDelete,
            ))
            .unwrap();

        // Stop before any timer has a chance to fire.
        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.aggregator.stop().await;

        let messages = wait_for_messages(&rig.messages, 1).await;
        assert_eq!(messages.len(), 1);
        assert!(rig
            .store
            .has_notified("late.example", LifecycleState::PendingDelete)
            .unwrap());

        rig.manager.stop().await;
    }
}
