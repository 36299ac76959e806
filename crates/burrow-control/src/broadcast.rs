//! Fan-out notifier
//!
//! A single dispatch task owns the subscriber set. Registration,
//! unregistration and publication all reach it through one command queue,
//! so they are applied in the order they were issued and the set needs no
//! lock of its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
#[error("Broadcast bus is closed")]
pub struct BusClosed;

enum Command<T> {
    Reg(u64, mpsc::Sender<T>),
    Unreg(u64),
    Publish(T, oneshot::Sender<()>),
}

/// One-to-many event bus.
///
/// Publishing waits until every subscriber registered at that moment has
/// received the item. Subscribers registered later never see it.
pub struct Broadcast<T> {
    commands: mpsc::UnboundedSender<Command<T>>,
    next_id: AtomicU64,
    stop: CancellationToken,
}

/// Receiving end handed out by [`Broadcast::reg`]
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next published item, or `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    /// Create the bus and spawn its dispatch task
    pub fn new() -> Arc<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        tokio::spawn(dispatch(rx, stop.clone()));
        Arc::new(Self {
            commands,
            next_id: AtomicU64::new(0),
            stop,
        })
    }

    /// Register a subscriber with a single-slot channel
    pub fn reg(&self) -> Result<Subscription<T>, BusClosed> {
        self.reg_with_capacity(1)
    }

    /// Register a subscriber whose channel buffers `capacity` items, so a
    /// slow reader holds up publishers only once the buffer is full
    pub fn reg_with_capacity(&self, capacity: usize) -> Result<Subscription<T>, BusClosed> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.send(Command::Reg(id, tx))?;
        Ok(Subscription { id, rx })
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unreg(&self, subscription: &Subscription<T>) {
        let _ = self.send(Command::Unreg(subscription.id));
    }

    /// Deliver `item` to every current subscriber
    pub async fn publish(&self, item: T) -> Result<(), BusClosed> {
        let (ack, delivered) = oneshot::channel();
        self.send(Command::Publish(item, ack))?;
        delivered.await.map_err(|_| BusClosed)
    }

    /// Stop the dispatch task. Idempotent; blocked publishers fail with
    /// [`BusClosed`] and subscribers see the end of their stream.
    pub fn close(&self) {
        if !self.stop.is_cancelled() {
            self.stop.cancel();
            debug!("Broadcast bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn send(&self, command: Command<T>) -> Result<(), BusClosed> {
        if self.stop.is_cancelled() {
            return Err(BusClosed);
        }
        self.commands.send(command).map_err(|_| BusClosed)
    }
}

impl<T> Drop for Broadcast<T> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn dispatch<T: Clone>(
    mut commands: mpsc::UnboundedReceiver<Command<T>>,
    stop: CancellationToken,
) {
    let mut subscribers: Vec<(u64, mpsc::Sender<T>)> = Vec::new();

    loop {
        let command = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Reg(id, tx) => subscribers.push((id, tx)),
            Command::Unreg(id) => {
                if let Some(pos) = subscribers.iter().position(|(sub, _)| *sub == id) {
                    subscribers.swap_remove(pos);
                }
            }
            Command::Publish(item, ack) => {
                let mut gone = Vec::new();
                for (id, tx) in &subscribers {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => return,
                        sent = tx.send(item.clone()) => {
                            // Receiver dropped without unregistering
                            if sent.is_err() {
                                gone.push(*id);
                            }
                        }
                    }
                }
                subscribers.retain(|(id, _)| !gone.contains(id));
                let _ = ack.send(());
            }
        }
    }

    debug!("Broadcast dispatch stopped ({} subscribers)", subscribers.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_five_subscribers_each_get_item_once() {
        let bus = Broadcast::new();
        let mut subs: Vec<_> = (0..5).map(|_| bus.reg().unwrap()).collect();

        let publisher = tokio::spawn({
            let bus = bus.clone();
            async move { bus.publish("hello".to_string()).await }
        });

        for sub in &mut subs {
            assert_eq!(sub.recv().await.as_deref(), Some("hello"));
        }
        publisher.await.unwrap().unwrap();

        for sub in &mut subs {
            assert_eq!(sub.try_recv(), None);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_items() {
        let bus = Broadcast::new();
        let mut early = bus.reg_with_capacity(4).unwrap();

        bus.publish(1u32).await.unwrap();
        let mut late = bus.reg_with_capacity(4).unwrap();
        bus.publish(2u32).await.unwrap();

        assert_eq!(early.recv().await, Some(1));
        assert_eq!(early.recv().await, Some(2));
        assert_eq!(late.recv().await, Some(2));
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn test_publish_waits_for_slow_subscriber() {
        let bus = Broadcast::new();
        let mut sub = bus.reg().unwrap();

        // The first item fills the single slot; the second must wait
        bus.publish(1u32).await.unwrap();
        let pending = timeout(Duration::from_millis(50), bus.publish(2u32)).await;
        assert!(pending.is_err());

        assert_eq!(sub.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_unreg_stops_delivery() {
        let bus = Broadcast::new();
        let mut kept = bus.reg_with_capacity(4).unwrap();
        let mut removed = bus.reg_with_capacity(4).unwrap();

        bus.unreg(&removed);
        bus.publish(7u32).await.unwrap();

        assert_eq!(kept.recv().await, Some(7));
        // Dispatch dropped its sender, so the channel ends empty
        assert_eq!(removed.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_skipped() {
        let bus = Broadcast::new();
        let dropped = bus.reg().unwrap();
        let mut kept = bus.reg_with_capacity(4).unwrap();
        drop(dropped);

        bus.publish(3u32).await.unwrap();
        assert_eq!(kept.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = Broadcast::<u32>::new();
        let mut sub = bus.reg().unwrap();

        bus.close();
        bus.close();

        assert!(bus.is_closed());
        assert!(bus.publish(1).await.is_err());
        assert!(bus.reg().is_err());
        assert_eq!(
            timeout(Duration::from_secs(1), sub.recv()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_close_unblocks_publisher() {
        let bus = Broadcast::new();
        let _sub = bus.reg().unwrap();
        bus.publish(1u32).await.unwrap();

        let blocked = tokio::spawn({
            let bus = bus.clone();
            async move { bus.publish(2u32).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.close();
        let result = timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert!(result.is_err());
    }
}
