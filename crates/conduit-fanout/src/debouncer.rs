//! Sliding-window event debouncer
//!
//! One task per consumer class owns a key -> event map. Each input resets a
//! single timer to fire one window from now; the first event for a key in a
//! window is kept and later ones are dropped. When the timer fires every
//! pending event is emitted once and the map is cleared. Cancellation stops
//! the task without flushing.

use std::collections::HashMap;
use std::time::Duration;

use conduit_common::WorkloadIdentity;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default coalescing window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Events that can be coalesced
pub trait DebounceKey {
    /// Events with the same key within one window collapse to the first
    fn debounce_key(&self) -> String;
}

impl DebounceKey for WorkloadIdentity {
    fn debounce_key(&self) -> String {
        WorkloadIdentity::debounce_key(self)
    }
}

/// Coalesces events between one input and one output channel
pub struct Debouncer<T> {
    name: &'static str,
    window: Duration,
    input: mpsc::Receiver<T>,
    output: mpsc::Sender<T>,
    cancel: CancellationToken,
}

impl<T> Debouncer<T>
where
    T: DebounceKey + Send + 'static,
{
    /// Create a debouncer; `name` labels its log lines
    pub fn new(
        name: &'static str,
        window: Duration,
        input: mpsc::Receiver<T>,
        output: mpsc::Sender<T>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            window: window.max(Duration::from_millis(1)),
            input,
            output,
            cancel,
        }
    }

    /// Run on a new task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled, the output closes, or the input closes
    pub async fn run(mut self) {
        let mut pending: HashMap<String, T> = HashMap::new();
        let mut timer = tokio::time::interval(self.window);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval is immediate
        timer.reset();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(debouncer = self.name, dropped = pending.len(), "debouncer cancelled");
                    return;
                }
                received = self.input.recv() => match received {
                    Some(event) => {
                        timer.reset();
                        let key = event.debounce_key();
                        if pending.contains_key(&key) {
                            trace!(debouncer = self.name, key = %key, "coalesced duplicate event");
                        } else {
                            pending.insert(key, event);
                        }
                    }
                    None => {
                        debug!(debouncer = self.name, "input closed, flushing");
                        self.flush(&mut pending).await;
                        return;
                    }
                },
                _ = timer.tick(), if !pending.is_empty() => {
                    if !self.flush(&mut pending).await {
                        return;
                    }
                }
            }
        }
    }

    /// Emit and clear every pending event; false if the output is gone or
    /// cancellation arrived while a send was blocked
    async fn flush(&self, pending: &mut HashMap<String, T>) -> bool {
        let count = pending.len();
        for (_, event) in pending.drain() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(debouncer = self.name, "cancelled while flushing");
                    return false;
                }
                sent = self.output.send(event) => {
                    if sent.is_err() {
                        debug!(debouncer = self.name, "output closed");
                        return false;
                    }
                }
            }
        }
        if count > 0 {
            debug!(debouncer = self.name, emitted = count, "flushed debounced events");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tokio::sync::mpsc::error::TryRecvError;

    #[derive(Debug, Clone, PartialEq)]
    struct Change {
        key: &'static str,
        seq: u32,
    }

    impl DebounceKey for Change {
        fn debounce_key(&self) -> String {
            self.key.to_string()
        }
    }

    struct Harness {
        tx: mpsc::Sender<Change>,
        rx: mpsc::Receiver<Change>,
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn start(window: Duration) -> Harness {
        let (tx, input) = mpsc::channel(16);
        let (output, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = Debouncer::new("test", window, input, output, cancel.clone()).spawn();
        Harness {
            tx,
            rx,
            cancel,
            handle,
        }
    }

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    /// Story: a multi-object apply touches the same aggregator three times
    ///
    /// Three events inside two seconds with a ten second window come out as
    /// exactly one event, and it is the first one.
    #[tokio::test(start_paused = true)]
    async fn story_burst_for_one_key_emits_first_event_once() {
        let mut h = start(Duration::from_secs(10));
        for seq in 0..3 {
            h.tx.send(Change { key: "agg", seq }).await.unwrap();
            sleep_secs(1).await;
        }

        let first = h.rx.recv().await.unwrap();
        assert_eq!(first, Change { key: "agg", seq: 0 });

        let more = tokio::time::timeout(Duration::from_secs(60), h.rx.recv()).await;
        assert!(more.is_err(), "expected no further events");
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_each_emit_once() {
        let mut h = start(Duration::from_secs(10));
        for (seq, key) in ["a", "b", "c", "b", "a"].into_iter().enumerate() {
            h.tx.send(Change {
                key,
                seq: seq as u32,
            })
            .await
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(h.rx.recv().await.unwrap());
        }
        let keys: BTreeSet<_> = seen.iter().map(|c| c.key).collect();
        assert_eq!(keys, BTreeSet::from(["a", "b", "c"]));
        // first writer wins per key
        assert!(seen.contains(&Change { key: "a", seq: 0 }));
        assert!(seen.contains(&Change { key: "b", seq: 1 }));

        let more = tokio::time::timeout(Duration::from_secs(60), h.rx.recv()).await;
        assert!(more.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn each_input_extends_the_window() {
        let mut h = start(Duration::from_secs(10));
        h.tx.send(Change { key: "a", seq: 0 }).await.unwrap();
        sleep_secs(8).await;
        h.tx.send(Change { key: "b", seq: 1 }).await.unwrap();

        // 13s after the first event, 5s after the second: still quiet
        sleep_secs(5).await;
        assert_eq!(h.rx.try_recv(), Err(TryRecvError::Empty));

        sleep_secs(6).await;
        let mut keys = vec![h.rx.recv().await.unwrap().key, h.rx.recv().await.unwrap().key];
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn next_window_starts_fresh() {
        let mut h = start(Duration::from_secs(10));
        h.tx.send(Change { key: "a", seq: 0 }).await.unwrap();
        assert_eq!(h.rx.recv().await.unwrap().seq, 0);

        h.tx.send(Change { key: "a", seq: 1 }).await.unwrap();
        assert_eq!(h.rx.recv().await.unwrap().seq, 1);
    }

    /// Story: the operator shuts down mid-window
    #[tokio::test(start_paused = true)]
    async fn story_cancellation_drops_pending_events() {
        let mut h = start(Duration::from_secs(10));
        h.tx.send(Change { key: "a", seq: 0 }).await.unwrap();
        sleep_secs(2).await;
        h.cancel.cancel();

        h.handle.await.unwrap();
        // The task dropped its sender without emitting anything
        assert_eq!(h.rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_output_stops_the_task() {
        let h = start(Duration::from_secs(10));
        drop(h.rx);
        h.tx.send(Change { key: "a", seq: 0 }).await.unwrap();
        tokio::time::timeout(Duration::from_secs(30), h.handle)
            .await
            .expect("debouncer should exit")
            .unwrap();
    }

    /// Story: the controller stops draining triggers during shutdown
    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_blocked_flush() {
        let (tx, input) = mpsc::channel(16);
        let (output, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle =
            Debouncer::new("test", Duration::from_secs(10), input, output, cancel.clone()).spawn();

        for key in ["a", "b", "c"] {
            tx.send(Change { key, seq: 0 }).await.unwrap();
        }
        // The window elapses and the flush stalls on the full output
        sleep_secs(11).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("debouncer should exit")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_flushes_and_exits() {
        let Harness {
            tx, mut rx, handle, ..
        } = start(Duration::from_secs(10));
        tx.send(Change { key: "a", seq: 0 }).await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(Change { key: "a", seq: 0 }));
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn workload_identity_keys_by_kind_namespace_and_name() {
        let id = WorkloadIdentity::aggregator("logging", "default");
        assert_eq!(DebounceKey::debounce_key(&id), "Aggregator/logging/default");
    }
}
