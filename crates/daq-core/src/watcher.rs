//! Edge-triggered completion watchers.
//!
//! A [`CompletionWatcher`] fires its callback exactly once, on the first
//! committed transition for which the predicate returns `true`, and then
//! deregisters itself. Watchers are edge-triggered: a transition that was
//! committed before the watcher was registered is never seen, so register
//! before issuing the write that causes the transition.
//!
//! [`PendingCompletion`] is the awaitable form used by the orchestrator. It
//! cancels its registration when dropped, which is how a timed-out waiter
//! withdraws without touching device state.

use crate::channel::{ChannelStore, ChannelValue, SubscriptionHandle};
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// A committed value change that matched a watcher's predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Full channel name
    pub channel: String,
    /// Value before the commit
    pub old: ChannelValue,
    /// Value after the commit
    pub new: ChannelValue,
}

type Slot = Arc<Mutex<Option<Box<dyn FnOnce(Transition) + Send>>>>;

/// Predicate matching `old == active && new == done`.
///
/// Never matches `done -> done` or `active -> active` repeats.
pub fn falling_edge(
    active: ChannelValue,
    done: ChannelValue,
) -> impl Fn(&ChannelValue, &ChannelValue) -> bool + Send + Sync + 'static {
    move |old, new| *old == active && *new == done
}

/// One-shot, self-deregistering transition watcher.
pub struct CompletionWatcher {
    store: ChannelStore,
    handle: SubscriptionHandle,
    slot: Slot,
}

impl std::fmt::Debug for CompletionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionWatcher")
            .field("channel", &self.handle.channel())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl CompletionWatcher {
    /// Register `callback` to run once when `predicate(old, new)` first holds.
    ///
    /// Dropping the returned value does not cancel the registration; call
    /// [`CompletionWatcher::cancel`] for that.
    pub fn watch<P, F>(
        store: &ChannelStore,
        channel: &str,
        predicate: P,
        callback: F,
    ) -> AppResult<Self>
    where
        P: Fn(&ChannelValue, &ChannelValue) -> bool + Send + Sync + 'static,
        F: FnOnce(Transition) + Send + 'static,
    {
        let full = store.full_name(channel)?;
        let slot: Slot = Arc::new(Mutex::new(Some(Box::new(callback))));

        let fire_slot = slot.clone();
        let name = full.clone();
        let handle = store.subscribe(&full, move |old, new| {
            if !predicate(old, new) {
                return ControlFlow::Continue(());
            }
            let callback = fire_slot.lock().take();
            if let Some(callback) = callback {
                trace!(channel = %name, old = %old, new = %new, "Watched transition matched");
                callback(Transition {
                    channel: name.clone(),
                    old: old.clone(),
                    new: new.clone(),
                });
            }
            ControlFlow::Break(())
        })?;

        Ok(Self {
            store: store.clone(),
            handle,
            slot,
        })
    }

    /// Full name of the watched channel
    pub fn channel(&self) -> &str {
        self.handle.channel()
    }

    /// Whether the callback has neither fired nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Deregister. Returns `true` if this pre-empted the callback.
    pub fn cancel(&self) -> bool {
        let pre_empted = self.slot.lock().take().is_some();
        self.store.unsubscribe(&self.handle);
        if pre_empted {
            debug!(channel = %self.channel(), "Watcher cancelled before firing");
        }
        pre_empted
    }
}

/// Awaitable completion; cancels its watcher on drop.
#[derive(Debug)]
pub struct PendingCompletion {
    watcher: CompletionWatcher,
    rx: oneshot::Receiver<Transition>,
}

/// Register a watcher whose transition can be awaited.
pub fn await_transition<P>(
    store: &ChannelStore,
    channel: &str,
    predicate: P,
) -> AppResult<PendingCompletion>
where
    P: Fn(&ChannelValue, &ChannelValue) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let watcher = CompletionWatcher::watch(store, channel, predicate, move |transition| {
        // Receiver gone means the waiter already gave up.
        let _ = tx.send(transition);
    })?;
    Ok(PendingCompletion { watcher, rx })
}

impl PendingCompletion {
    /// Full name of the watched channel
    pub fn channel(&self) -> &str {
        self.watcher.channel()
    }

    /// The transition, if it has already fired.
    pub fn try_take(&mut self) -> Option<Transition> {
        self.rx.try_recv().ok()
    }

    /// Wait for the transition, optionally bounded by `timeout`.
    pub async fn wait(mut self, timeout: Option<Duration>) -> AppResult<Transition> {
        let channel = self.channel().to_string();
        let received = match timeout {
            Some(after) => tokio::time::timeout(after, &mut self.rx)
                .await
                .map_err(|_| DaqError::timeout(channel.clone(), after))?,
            None => (&mut self.rx).await,
        };
        received.map_err(|_| DaqError::Lifecycle(format!("Watcher on '{}' was cancelled", channel)))
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        self.watcher.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ACTIVE: i64 = 1;
    const DONE: i64 = 0;

    fn store() -> ChannelStore {
        ChannelStore::from_table(
            "PE1:",
            vec![ChannelSpec::enumeration("cam1:Acquire", &["Done", "Acquire"], DONE).status()],
        )
        .unwrap()
    }

    fn counting_watcher(store: &ChannelStore) -> (CompletionWatcher, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let watcher = CompletionWatcher::watch(
            store,
            "cam1:Acquire",
            falling_edge(ChannelValue::Int(ACTIVE), ChannelValue::Int(DONE)),
            move |_| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        (watcher, fired)
    }

    #[test]
    fn test_fires_once_on_falling_edge_only() {
        let store = store();
        let (watcher, fired) = counting_watcher(&store);

        store.commit("cam1:Acquire", DONE).unwrap(); // DONE -> DONE
        store.commit("cam1:Acquire", ACTIVE).unwrap(); // DONE -> ACTIVE
        store.commit("cam1:Acquire", ACTIVE).unwrap(); // ACTIVE -> ACTIVE
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(watcher.is_pending());

        store.commit("cam1:Acquire", DONE).unwrap(); // ACTIVE -> DONE
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watcher.is_pending());

        store.commit("cam1:Acquire", ACTIVE).unwrap();
        store.commit("cam1:Acquire", DONE).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count("cam1:Acquire").unwrap(), 0);
    }

    #[test]
    fn test_cancel_prevents_callback() {
        let store = store();
        let (watcher, fired) = counting_watcher(&store);

        assert!(watcher.cancel());
        store.commit("cam1:Acquire", ACTIVE).unwrap();
        store.commit("cam1:Acquire", DONE).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!watcher.cancel());
    }

    #[test]
    fn test_registration_after_transition_does_not_fire() {
        let store = store();
        store.commit("cam1:Acquire", ACTIVE).unwrap();
        store.commit("cam1:Acquire", DONE).unwrap();

        let (watcher, fired) = counting_watcher(&store);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(watcher.is_pending());
    }

    #[tokio::test]
    async fn test_pending_completion_resolves() {
        let store = store();
        let pending = await_transition(
            &store,
            "cam1:Acquire",
            falling_edge(ChannelValue::Int(ACTIVE), ChannelValue::Int(DONE)),
        )
        .unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            writer.commit("cam1:Acquire", ACTIVE).unwrap();
            tokio::task::yield_now().await;
            writer.commit("cam1:Acquire", DONE).unwrap();
        });

        let transition = pending.wait(None).await.unwrap();
        assert_eq!(transition.channel, "PE1:cam1:Acquire");
        assert_eq!(transition.old, ChannelValue::Int(ACTIVE));
        assert_eq!(transition.new, ChannelValue::Int(DONE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_completion_timeout_deregisters() {
        let store = store();
        let pending = await_transition(
            &store,
            "cam1:Acquire",
            falling_edge(ChannelValue::Int(ACTIVE), ChannelValue::Int(DONE)),
        )
        .unwrap();
        assert_eq!(store.subscriber_count("cam1:Acquire").unwrap(), 1);

        let err = pending
            .wait(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
        assert_eq!(store.subscriber_count("cam1:Acquire").unwrap(), 0);
    }

    #[test]
    fn test_try_take_after_fire() {
        let store = store();
        let mut pending = await_transition(
            &store,
            "cam1:Acquire",
            falling_edge(ChannelValue::Int(ACTIVE), ChannelValue::Int(DONE)),
        )
        .unwrap();
        assert!(pending.try_take().is_none());

        store.commit("cam1:Acquire", ACTIVE).unwrap();
        store.commit("cam1:Acquire", DONE).unwrap();
        assert!(pending.try_take().is_some());
    }
}
