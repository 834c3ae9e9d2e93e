//! Rate-limited "telemetry changed" notifications
//!
//! CAN telemetry arrives in bursts of a dozen frames every 100 ms. Consumers only
//! need to know that something changed, so [`ChangeNotifier`] coalesces a burst
//! into at most one notification per interval. A change that lands inside the
//! interval is remembered and delivered by [`ChangeNotifier::flush_pending`], which
//! the flush task calls on every interval tick.
//!
//! Notifications carry no payload. Observers re-read the shared snapshot; the watch
//! channel carries a generation counter for async consumers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Change callback
pub type Observer = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`ChangeNotifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct NotifyState {
    last_fire: Option<Instant>,
    pending: bool,
    observers: Vec<(ObserverId, Observer)>,
    next_id: u64,
}

/// Coalescing change notifier
pub struct ChangeNotifier {
    min_interval: Duration,
    state: Mutex<NotifyState>,
    generation: watch::Sender<u64>,
}

impl ChangeNotifier {
    pub fn new(min_interval: Duration) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            min_interval,
            state: Mutex::new(NotifyState {
                last_fire: None,
                pending: false,
                observers: Vec::new(),
                next_id: 0,
            }),
            generation,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Register a callback run on every delivered notification
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = ObserverId(state.next_id);
        state.next_id += 1;
        state.observers.push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut state = self.lock();
        let before = state.observers.len();
        state.observers.retain(|(observer_id, _)| *observer_id != id);
        state.observers.len() != before
    }

    /// Receiver that sees the generation counter advance on every notification
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Number of notifications delivered so far
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending
    }

    /// Record a change; returns whether a notification went out now
    pub fn mark_changed(&self) -> bool {
        self.try_fire(true)
    }

    /// Deliver a change held back by the rate limit, once the interval allows it
    pub fn flush_pending(&self) -> bool {
        self.try_fire(false)
    }

    fn try_fire(&self, changed: bool) -> bool {
        let observers = {
            let mut state = self.lock();
            if changed {
                state.pending = true;
            }
            if !state.pending {
                return false;
            }
            let now = Instant::now();
            let ready = state
                .last_fire
                .map_or(true, |last| now.duration_since(last) >= self.min_interval);
            if !ready {
                return false;
            }
            state.pending = false;
            state.last_fire = Some(now);
            state
                .observers
                .iter()
                .map(|(_, observer)| observer.clone())
                .collect::<Vec<_>>()
        };

        self.generation.send_modify(|g| *g += 1);
        for observer in observers {
            observer();
        }
        true
    }

    /// Flush held-back changes on every interval tick until `shutdown` turns true
    pub fn spawn_flush_task(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(notifier.min_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        notifier.flush_pending();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("change notifier flush task stopped");
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NotifyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("min_interval", &self.min_interval)
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced() {
        let notifier = ChangeNotifier::new(Duration::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        notifier.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(notifier.mark_changed());
        for _ in 0..10 {
            assert!(!notifier.mark_changed());
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(notifier.has_pending());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!notifier.flush_pending());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(notifier.flush_pending());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.generation(), 2);

        // nothing pending, nothing to flush
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!notifier.flush_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_and_watch() {
        let notifier = ChangeNotifier::new(Duration::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = notifier.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut changes = notifier.changes();

        notifier.mark_changed();
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 1);

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        tokio::time::advance(Duration::from_millis(100)).await;
        notifier.mark_changed();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*changes.borrow_and_update(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_task_delivers_trailing_change() {
        let notifier = Arc::new(ChangeNotifier::new(Duration::from_millis(100)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = notifier.spawn_flush_task(shutdown_rx);

        notifier.mark_changed();
        notifier.mark_changed();
        assert_eq!(notifier.generation(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(notifier.generation(), 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
