use async_channel::{Receiver, Sender};
use parking_lot::Mutex;

struct NotifierState<T> {
    subscribers: Vec<Sender<T>>,
    // created with the notifier and handed to the first subscriber, so
    // nothing published before anyone subscribed is lost
    pending: Option<Receiver<T>>,
    closed: bool,
}

/// Fans events out to every subscriber over bounded channels.
///
/// Publishing waits until each live subscriber has room for the event, so a
/// subscriber that falls behind slows the publisher down instead of missing
/// events. A subscriber that drops its receiver is forgotten on the next
/// publish.
pub(crate) struct Notifier<T> {
    capacity: usize,
    state: Mutex<NotifierState<T>>,
}

impl<T: Clone> Notifier<T> {
    /// Events published while nobody is subscribed are discarded.
    pub(crate) fn new(capacity: usize) -> Notifier<T> {
        Notifier {
            capacity: capacity.max(1),
            state: Mutex::new(NotifierState {
                subscribers: Vec::new(),
                pending: None,
                closed: false,
            }),
        }
    }

    /// Events published before the first subscription are held for the first
    /// subscriber. Once `capacity` of them are waiting, publishing blocks
    /// until somebody subscribes and reads.
    pub(crate) fn retaining(capacity: usize) -> Notifier<T> {
        let notifier = Self::new(capacity);
        let (sender, receiver) = async_channel::bounded(notifier.capacity);
        {
            let mut state = notifier.state.lock();
            state.subscribers.push(sender);
            state.pending = Some(receiver);
        }
        notifier
    }

    pub(crate) fn subscribe(&self) -> Receiver<T> {
        let mut state = self.state.lock();
        if let Some(receiver) = state.pending.take() {
            return receiver;
        }
        let (sender, receiver) = async_channel::bounded(self.capacity);
        // on a closed notifier the sender is dropped here and the receiver
        // reports the end of the stream right away
        if !state.closed {
            state.subscribers.push(sender);
        }
        receiver
    }

    pub(crate) async fn publish(&self, event: T) {
        let subscribers = self.state.lock().subscribers.clone();
        let mut gone = Vec::new();
        for subscriber in &subscribers {
            if subscriber.send(event.clone()).await.is_err() {
                gone.push(subscriber);
            }
        }
        if !gone.is_empty() {
            self.state
                .lock()
                .subscribers
                .retain(|subscriber| !gone.iter().any(|g| g.same_channel(subscriber)));
        }
    }

    /// Drops the receiver held for a first subscriber that never came, so a
    /// publisher blocked on it gives up.
    pub(crate) fn release_pending(&self) {
        let pending = self.state.lock().pending.take();
        drop(pending);
    }

    /// Ends every subscription once its buffered events are read. Later
    /// subscriptions end immediately. An unclaimed first subscription keeps
    /// its buffered events.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}
