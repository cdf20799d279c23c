//! Ordered hand-off of [`Event`]s from a blocking pipeline worker to its consumer.
//!
//! The channel is the only buffer between the two sides of a session. The
//! producer never blocks: `send` appends and signals. Consumers either block
//! a thread in bounded waits ([`BlockingEventChannel::iter`]) or await
//! ([`BlockingEventChannel::recv`]); both re-check closure every
//! `poll_interval`, so a stalled worker can never hang a consumer forever.
//!
//! ```text
//! worker thread ── send(event) ──> [ VecDeque<Slot> ] ──> recv().await  (HTTP task)
//!               ── send_end() ──>  Slot::End          ──> None
//! consumer drop ── cancel() ─────> closed + token cancelled
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kag_bridge_common::Event;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default bounded wait between closure checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Slot {
    Event(Event),
    /// Sentinel: end of sequence once everything before it is consumed.
    End,
}

#[derive(Default)]
struct ChannelState {
    slots: VecDeque<Slot>,
    /// No further sends are accepted.
    sealed: bool,
    /// Nothing more will be delivered once `slots` is drained.
    closed: bool,
}

/// Result of a single non-blocking or bounded receive attempt.
#[derive(Debug)]
pub enum Recv {
    Event(Event),
    /// Nothing buffered yet; the channel is still open.
    Empty,
    /// Closed and fully drained.
    Closed,
}

pub struct BlockingEventChannel {
    state: Mutex<ChannelState>,
    available: Condvar,
    notify: Notify,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl Default for BlockingEventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl BlockingEventChannel {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_cancellation(poll_interval, CancellationToken::new())
    }

    /// Build a channel that closes itself when `cancel` fires.
    pub fn with_cancellation(poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            available: Condvar::new(),
            notify: Notify::new(),
            cancel,
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // A panicking producer must not take the consumer down with it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.available.notify_all();
        self.notify.notify_one();
    }

    /// Append an event. Dropped with a warning once the channel is closed.
    pub fn send(&self, event: Event) {
        {
            let mut state = self.lock();
            if state.sealed || state.closed || self.cancel.is_cancelled() {
                tracing::warn!(tag = %event.tag, "Attempting to send event to closed channel");
                return;
            }
            state.slots.push_back(Slot::Event(event));
        }
        self.wake();
    }

    /// Queue the end-of-sequence sentinel. Events sent before it are still
    /// delivered; later sends are dropped.
    pub fn send_end(&self) {
        {
            let mut state = self.lock();
            if state.sealed || state.closed {
                return;
            }
            state.sealed = true;
            state.slots.push_back(Slot::End);
        }
        self.wake();
    }

    /// Close immediately. Idempotent. Buffered events remain drainable.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.sealed = true;
            state.closed = true;
        }
        self.wake();
    }

    /// Consumer-side cancellation: fire the token and close.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.close();
    }

    /// Fatal internal failure: log it and close so the sequence terminates.
    pub fn fail(&self, err: &dyn std::fmt::Display) {
        tracing::error!(error = %err, "Exception in event channel");
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.lock().closed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Number of buffered events (the sentinel is not counted).
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Event(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, state: &mut ChannelState) -> Recv {
        match state.slots.pop_front() {
            Some(Slot::Event(event)) => Recv::Event(event),
            Some(Slot::End) => {
                state.closed = true;
                Recv::Closed
            }
            None if state.closed || self.cancel.is_cancelled() => Recv::Closed,
            None => Recv::Empty,
        }
    }

    /// Take the next event without waiting.
    pub fn try_recv(&self) -> Recv {
        let mut state = self.lock();
        self.take(&mut state)
    }

    /// Wait at most `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Recv {
        let mut state = self.lock();
        if state.slots.is_empty() && !state.closed && !self.cancel.is_cancelled() {
            state = self
                .available
                .wait_timeout(state, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        self.take(&mut state)
    }

    /// Block the calling thread until an event arrives or the channel is
    /// closed and drained.
    pub fn recv_blocking(&self) -> Option<Event> {
        loop {
            match self.recv_timeout(self.poll_interval) {
                Recv::Event(event) => return Some(event),
                Recv::Closed => return None,
                Recv::Empty => continue,
            }
        }
    }

    /// Await the next event without blocking the executor thread.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            match self.try_recv() {
                Recv::Event(event) => return Some(event),
                Recv::Closed => return None,
                Recv::Empty => {}
            }
            // `notify_one` stores a permit, so a send racing this await is not lost.
            let _ = tokio::time::timeout(self.poll_interval, self.notify.notified()).await;
        }
    }

    /// Blocking iterator over the remaining events.
    pub fn iter(&self) -> Events<'_> {
        Events { channel: self }
    }
}

/// Consumer-side iterator adapter over a [`BlockingEventChannel`].
pub struct Events<'a> {
    channel: &'a BlockingEventChannel,
}

impl Iterator for Events<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.channel.recv_blocking()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kag_bridge_common::EventStatus;
    use std::sync::Arc;
    use std::time::Instant;

    fn event(content: &str) -> Event {
        Event::stage("answer", "answer", content, EventStatus::Ok)
    }

    #[test]
    fn single_producer_order_is_preserved() {
        let channel = Arc::new(BlockingEventChannel::new(Duration::from_millis(5)));
        let producer = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    channel.send(event(&i.to_string()));
                }
                channel.send_end();
            })
        };

        let received: Vec<String> = channel.iter().map(|e| e.content).collect();
        producer.join().unwrap();

        let expected: Vec<String> = (0..500).map(|i| i.to_string()).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn next_after_close_with_empty_buffer_does_not_block() {
        let channel = BlockingEventChannel::new(Duration::from_secs(30));
        channel.close();

        let started = Instant::now();
        assert!(channel.iter().next().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn close_still_drains_buffered_events() {
        let channel = BlockingEventChannel::default();
        channel.send(event("a"));
        channel.send(event("b"));
        channel.close();

        let contents: Vec<String> = channel.iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[test]
    fn send_after_close_is_dropped() {
        let channel = BlockingEventChannel::default();
        channel.close();
        channel.send(event("late"));
        assert!(channel.is_empty());
        assert!(matches!(channel.try_recv(), Recv::Closed));
    }

    #[test]
    fn sentinel_ends_sequence_and_seals_channel() {
        let channel = BlockingEventChannel::default();
        channel.send(event("first"));
        channel.send_end();
        channel.send(event("after-end"));

        assert_eq!(channel.len(), 1);
        assert_eq!(channel.recv_blocking().unwrap().content, "first");
        assert!(channel.recv_blocking().is_none());
        assert!(channel.is_closed());
    }

    #[test]
    fn close_is_idempotent() {
        let channel = BlockingEventChannel::default();
        channel.close();
        channel.close();
        channel.send_end();
        assert!(matches!(channel.try_recv(), Recv::Closed));
    }

    #[test]
    fn recv_timeout_reports_empty_while_open() {
        let channel = BlockingEventChannel::default();
        assert!(matches!(
            channel.recv_timeout(Duration::from_millis(10)),
            Recv::Empty
        ));
    }

    #[test]
    fn blocked_consumer_wakes_on_close() {
        let channel = Arc::new(BlockingEventChannel::new(Duration::from_secs(30)));
        let closer = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                channel.close();
            })
        };

        let started = Instant::now();
        assert!(channel.recv_blocking().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        closer.join().unwrap();
    }

    #[test]
    fn fail_closes_channel() {
        let channel = BlockingEventChannel::default();
        channel.fail(&"reporter crashed");
        assert!(channel.is_closed());
        assert!(channel.recv_blocking().is_none());
    }

    #[test]
    fn cancel_fires_token_and_closes() {
        let token = CancellationToken::new();
        let channel = BlockingEventChannel::with_cancellation(DEFAULT_POLL_INTERVAL, token.clone());
        channel.cancel();
        assert!(token.is_cancelled());
        assert!(channel.is_cancelled());
        channel.send(event("ignored"));
        assert!(channel.is_empty());
    }

    #[test]
    fn external_token_cancellation_is_observed() {
        let token = CancellationToken::new();
        let channel = BlockingEventChannel::with_cancellation(DEFAULT_POLL_INTERVAL, token.clone());
        token.cancel();
        assert!(channel.is_closed());
        assert!(matches!(channel.try_recv(), Recv::Closed));
    }

    #[tokio::test]
    async fn async_recv_receives_events_from_thread() {
        let channel = Arc::new(BlockingEventChannel::new(Duration::from_millis(10)));
        let producer = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                for word in ["Hel", "Hello", "Hello world"] {
                    channel.send(event(word));
                    std::thread::sleep(Duration::from_millis(2));
                }
                channel.send_end();
            })
        };

        let mut seen = Vec::new();
        while let Some(event) = channel.recv().await {
            seen.push(event.content);
        }
        producer.join().unwrap();
        assert_eq!(seen, vec!["Hel", "Hello", "Hello world"]);
    }

    #[tokio::test]
    async fn async_recv_returns_none_when_closed() {
        let channel = BlockingEventChannel::new(Duration::from_secs(30));
        channel.close();
        let result = tokio::time::timeout(Duration::from_secs(1), channel.recv()).await;
        assert!(matches!(result, Ok(None)));
    }
}
