// src/events/channel.rs

//! Bounded event channel with a fatal-shutdown protocol
//!
//! Normal events never block the producer: when the queue is full the event
//! is dropped and a warning is logged. An error event is different. With no
//! consumer attached it is logged and the process exits. With a consumer it
//! is delivered, the producer waits until every queued event has been
//! acknowledged (or the drain timeout passes), and then the process exits.

use super::{Event, EventFilter, EventKind};
use crate::config::DEFAULT_DRAIN_TIMEOUT_SECS;
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Ends the process after a fatal event
pub trait Terminate: Send {
    fn terminate(&self, code: i32);
}

/// Exits the current process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl Terminate for ProcessExit {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Count of delivered but unacknowledged events
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    /// Wait until every event has been acknowledged; false past the deadline
    fn wait_drained(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        self.drained
            .wait_while_until(&mut count, |count| *count > 0, deadline);
        *count == 0
    }
}

/// Create a bounded channel holding at most `capacity` events
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    let pending = Arc::new(Pending::default());

    let sender = EventSender {
        tx: Some(tx),
        pending: pending.clone(),
        ..EventSender::detached()
    };

    (sender, EventReceiver { rx, pending })
}

/// Producer side, owned by the engine callbacks
pub struct EventSender {
    tx: Option<flume::Sender<Event>>,
    pending: Arc<Pending>,
    filter: EventFilter,
    drain_timeout: Duration,
    terminator: Box<dyn Terminate>,
    dropped: usize,
}

impl EventSender {
    /// A sender with no consumer; events are only logged
    pub fn detached() -> Self {
        Self {
            tx: None,
            pending: Arc::new(Pending::default()),
            filter: EventFilter::new(),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            terminator: Box::new(ProcessExit),
            dropped: 0,
        }
    }

    /// How long a fatal event waits for the consumer to drain the queue
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Replace what happens after a fatal event
    pub fn with_terminator(mut self, terminator: impl Terminate + 'static) -> Self {
        self.terminator = Box::new(terminator);
        self
    }

    /// Whether a consumer is still listening
    pub fn is_attached(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_disconnected())
    }

    /// Number of events dropped because the queue was full
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Send an event, suppressing a repeat of the previous event of its kind
    ///
    /// Error events never return normally outside of tests: they terminate
    /// the process through the configured `Terminate`.
    #[track_caller]
    pub fn send(&mut self, event: Event) {
        if !self.filter.admit(&event) {
            return;
        }

        if event.kind == EventKind::Error {
            let location = Location::caller();
            let text = format!("{}: {}:{}", event.text, location.file(), location.line());
            self.shutdown(Event::error(text));
        } else {
            self.enqueue(event);
        }
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.send(Event::info(text));
    }

    pub fn percent(&mut self, value: f64) {
        self.send(Event::percent(value));
    }

    /// Report an unrecoverable error and terminate
    #[track_caller]
    pub fn fatal(&mut self, text: impl Into<String>) {
        self.send(Event::error(text));
    }

    fn enqueue(&mut self, event: Event) {
        let Some(tx) = &self.tx else {
            debug!("{}", event);
            return;
        };

        self.pending.add();
        match tx.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                self.pending.done();
                self.dropped += 1;
                warn!("Event queue is full, dropping {}", event);
            }
            Err(flume::TrySendError::Disconnected(event)) => {
                self.pending.done();
                debug!("{}", event);
            }
        }
    }

    fn shutdown(&mut self, event: Event) {
        let tx = match &self.tx {
            Some(tx) if !tx.is_disconnected() => tx.clone(),
            _ => {
                error!("{}", event.text);
                self.terminator.terminate(1);
                return;
            }
        };

        debug!("Delivering fatal event to consumer: {}", event.text);
        // Delivery and drain share one deadline
        let deadline = Instant::now() + self.drain_timeout;
        self.pending.add();
        if let Err(e) = tx.send_deadline(event, deadline) {
            self.pending.done();
            error!("{}", e.into_inner().text);
        }

        if !self.pending.wait_drained(deadline) {
            warn!(
                "Event consumer did not drain the queue within {:?}",
                self.drain_timeout
            );
        }

        self.terminator.terminate(1);
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::detached()
    }
}

/// Consumer side of the channel
pub struct EventReceiver {
    rx: flume::Receiver<Event>,
    pending: Arc<Pending>,
}

impl EventReceiver {
    fn wrap(&self, event: Event) -> Received {
        Received {
            event,
            pending: self.pending.clone(),
        }
    }

    /// Block until an event arrives; `None` once the sender is gone and the queue is empty
    pub fn recv(&self) -> Option<Received> {
        self.rx.recv().ok().map(|event| self.wrap(event))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Received> {
        self.rx.recv_timeout(timeout).ok().map(|event| self.wrap(event))
    }

    pub fn try_recv(&self) -> Option<Received> {
        self.rx.try_recv().ok().map(|event| self.wrap(event))
    }

    /// Take and acknowledge every event currently queued
    pub fn drain(&self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv())
            .map(Received::into_event)
            .collect()
    }

    /// Blocking iterator over received events
    pub fn iter(&self) -> impl Iterator<Item = Received> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// A received event; acknowledged when dropped
pub struct Received {
    event: Event,
    pending: Arc<Pending>,
}

impl Received {
    /// Acknowledge the event and take ownership of it
    pub fn into_event(mut self) -> Event {
        std::mem::replace(&mut self.event, Event::info(String::new()))
    }
}

impl Deref for Received {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

impl Drop for Received {
    fn drop(&mut self) {
        self.pending.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::thread;

    #[derive(Clone, Default)]
    struct Recorder(Arc<AtomicI32>);

    impl Terminate for Recorder {
        fn terminate(&self, code: i32) {
            self.0.store(code, Ordering::SeqCst);
        }
    }

    impl Recorder {
        fn code(&self) -> i32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_events_arrive_in_order() {
        let (mut tx, rx) = event_channel(8);
        tx.info("one");
        tx.percent(0.25);
        tx.info("two");

        let events = rx.drain();
        assert_eq!(
            events,
            vec![Event::info("one"), Event::percent(0.25), Event::info("two")]
        );
    }

    #[test]
    fn test_repeated_event_is_sent_once() {
        let (mut tx, rx) = event_channel(8);
        tx.info("Checking dependencies...");
        tx.info("Checking dependencies...");
        tx.percent(0.5);
        tx.percent(0.5);
        assert_eq!(rx.drain().len(), 2);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (mut tx, rx) = event_channel(2);
        tx.info("a");
        tx.info("b");
        tx.info("c");

        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.drain(), vec![Event::info("a"), Event::info("b")]);
    }

    #[test]
    fn test_fatal_without_consumer_terminates() {
        let recorder = Recorder::default();
        let mut tx = EventSender::detached().with_terminator(recorder.clone());
        assert!(!tx.is_attached());

        tx.fatal("Can't install packages");
        assert_eq!(recorder.code(), 1);
    }

    #[test]
    fn test_fatal_with_dropped_consumer_terminates() {
        let recorder = Recorder::default();
        let (tx, rx) = event_channel(4);
        let mut tx = tx.with_terminator(recorder.clone());
        drop(rx);
        assert!(!tx.is_attached());

        tx.fatal("boom");
        assert_eq!(recorder.code(), 1);
    }

    #[test]
    fn test_fatal_waits_for_consumer_to_drain() {
        let recorder = Recorder::default();
        let (tx, rx) = event_channel(8);
        let mut tx = tx
            .with_terminator(recorder.clone())
            .with_drain_timeout(Duration::from_secs(10));

        tx.info("Downloading bash...");
        tx.percent(0.5);

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut seen = Vec::new();
            while let Some(event) = rx.recv_timeout(Duration::from_secs(5)) {
                let done = event.kind == EventKind::Error;
                seen.push(event.into_event());
                if done {
                    break;
                }
            }
            seen
        });

        tx.fatal("boom");
        assert_eq!(recorder.code(), 1);

        let seen = consumer.join().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], Event::info("Downloading bash..."));
        assert_eq!(seen[2].kind, EventKind::Error);
        assert!(seen[2].text.starts_with("boom: "));
        assert!(seen[2].text.contains("channel.rs"));
    }

    #[test]
    fn test_fatal_drain_times_out() {
        let recorder = Recorder::default();
        let (tx, rx) = event_channel(8);
        let mut tx = tx
            .with_terminator(recorder.clone())
            .with_drain_timeout(Duration::from_millis(50));

        tx.info("never read");
        tx.fatal("boom");

        assert_eq!(recorder.code(), 1);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_fatal_on_full_queue_waits_one_timeout() {
        let recorder = Recorder::default();
        let (tx, rx) = event_channel(1);
        let timeout = Duration::from_millis(300);
        let mut tx = tx.with_terminator(recorder.clone()).with_drain_timeout(timeout);

        tx.info("fills the queue");
        let start = Instant::now();
        tx.fatal("boom");
        let elapsed = start.elapsed();

        assert_eq!(recorder.code(), 1);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200), "took {:?}", elapsed);
        assert_eq!(rx.drain(), vec![Event::info("fills the queue")]);
    }

    #[test]
    fn test_received_event_acknowledged_on_drop() {
        let (mut tx, rx) = event_channel(4);
        tx.info("hello");
        assert_eq!(*tx.pending.count.lock(), 1);

        let event = rx.recv().unwrap();
        assert_eq!(event.text, "hello");
        assert_eq!(*tx.pending.count.lock(), 1);
        drop(event);
        assert_eq!(*tx.pending.count.lock(), 0);
    }
}
