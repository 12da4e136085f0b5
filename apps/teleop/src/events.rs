//! Outbound event streams.
//!
//! Every component publishes its own event type on an [`EventStream`]. Emitting
//! never blocks and never fails: with no subscribers the event is dropped, and a
//! subscriber that falls behind loses the oldest buffered events.

use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct EventStream<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventStream<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

impl<E: Clone> Default for EventStream<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<E> Clone for EventStream<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Drain everything currently buffered on a receiver, skipping over lag gaps.
pub fn drain<E: Clone>(receiver: &mut broadcast::Receiver<E>) -> Vec<E> {
    let mut out = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        let stream: EventStream<u32> = EventStream::new(4);
        stream.emit(1);
        stream.emit(2);
    }

    #[test]
    fn lagging_subscriber_keeps_newest_events() {
        let stream: EventStream<u32> = EventStream::new(2);
        let mut rx = stream.subscribe();
        for value in 0..5 {
            stream.emit(value);
        }
        assert_eq!(drain(&mut rx), vec![3, 4]);
    }

    #[tokio::test]
    async fn clones_share_subscribers() {
        let stream: EventStream<&'static str> = EventStream::default();
        let mut rx = stream.subscribe();
        stream.clone().emit("hello");
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
