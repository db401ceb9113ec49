//! # Audio Playback Queue
//!
//! Serializes spoken feedback to the one physical audio output the process
//! has. The queue and its "playing" flag are deliberately process-wide:
//! one instance lives in `AppState` and every session that wants to speak
//! goes through it.
//!
//! ## Guarantees:
//! - **Strict FIFO**: items play in enqueue order, one at a time
//! - **De-duplication**: enqueueing text identical to an already-queued or
//!   currently-playing item is a no-op (its callback resolves immediately)
//! - **Bounded**: at most `capacity` pending items; the oldest pending item
//!   is evicted when a new one would exceed the cap
//! - **Failure isolation**: a synthesis/playback failure drops that item,
//!   reports it through the item's callback, and the queue advances
//! - **Idempotent teardown**: a session can be torn down any number of
//!   times, before or after it ever spoke

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Playback/synthesis failure reported by the audio collaborator.
#[derive(Debug, Clone)]
pub struct PlaybackError(pub String);

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "playback error: {}", self.0)
    }
}

impl std::error::Error for PlaybackError {}

/// Audio synthesis/playback collaborator. `play` resolves when playback of
/// the given text has finished (or failed).
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, text: &str) -> Result<(), PlaybackError>;

    /// Release the underlying playback resource. Called when teardown
    /// leaves the queue empty.
    async fn release(&self) {}
}

/// Stand-in sink used in production builds until a real TTS device is
/// wired up: logs the line and sleeps roughly as long as speaking it
/// would take.
pub struct SimulatedSink;

#[async_trait]
impl AudioSink for SimulatedSink {
    async fn play(&self, text: &str) -> Result<(), PlaybackError> {
        let words = text.split_whitespace().count() as u64;
        let duration_ms = (300 + words * 150).min(8_000);
        debug!(words, duration_ms, "speaking: {}", text);
        tokio::time::sleep(std::time::Duration::from_millis(duration_ms)).await;
        Ok(())
    }
}

/// Invoked exactly once when the item finishes, fails, or is evicted.
pub type OnEnd = Box<dyn FnOnce(Result<(), PlaybackError>) + Send>;

/// One line of spoken feedback waiting its turn.
pub struct QueueItem {
    pub text: String,

    /// Owning session, used by teardown to purge that session's items
    pub session_id: Option<String>,

    pub on_end: Option<OnEnd>,
}

impl QueueItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            on_end: None,
        }
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn on_end(mut self, callback: OnEnd) -> Self {
        self.on_end = Some(callback);
        self
    }

    fn finish(mut self, result: Result<(), PlaybackError>) {
        if let Some(callback) = self.on_end.take() {
            callback(result);
        }
    }
}

struct QueueInner {
    pending: VecDeque<QueueItem>,

    /// Text of the item currently at the sink, if any. Disjoint from
    /// `pending`: an item is popped when playback starts.
    current: Option<String>,

    /// Process-wide single-flight flag; true while a drain loop is running
    playing: bool,
}

/// Process-wide playback queue. Constructed once and injected wherever a
/// session needs to speak.
pub struct AudioPlaybackQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    sink: Arc<dyn AudioSink>,
}

impl AudioPlaybackQueue {
    pub fn new(capacity: usize, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                current: None,
                playing: false,
            }),
            capacity,
            sink,
        }
    }

    /// Queue a line of feedback for playback.
    ///
    /// Duplicate text already queued or playing resolves the new item's
    /// callback immediately (the line will be heard; saying it twice from
    /// a rapid re-trigger is exactly what de-dup prevents). When the
    /// pending list is full the oldest pending item is evicted and its
    /// callback receives an error.
    pub fn enqueue(self: &Arc<Self>, item: QueueItem) {
        let evicted;
        {
            let mut inner = self.inner.lock().unwrap();

            let duplicate = inner.current.as_deref() == Some(item.text.as_str())
                || inner.pending.iter().any(|queued| queued.text == item.text);
            if duplicate {
                debug!("dropping duplicate playback item: {}", item.text);
                drop(inner);
                item.finish(Ok(()));
                return;
            }

            evicted = if inner.pending.len() >= self.capacity {
                inner.pending.pop_front()
            } else {
                None
            };

            inner.pending.push_back(item);

            if !inner.playing {
                inner.playing = true;
                let queue = Arc::clone(self);
                tokio::spawn(async move { queue.process_queue().await });
            }
        }

        if let Some(old) = evicted {
            warn!("playback queue full, evicting oldest item: {}", old.text);
            old.finish(Err(PlaybackError("evicted from full queue".to_string())));
        }
    }

    /// Drain loop. Exactly one instance runs at a time, guarded by the
    /// `playing` flag which is only set under the queue lock.
    async fn process_queue(self: Arc<Self>) {
        loop {
            let item = {
                let mut inner = self.inner.lock().unwrap();
                match inner.pending.pop_front() {
                    Some(item) => {
                        inner.current = Some(item.text.clone());
                        item
                    }
                    None => {
                        inner.playing = false;
                        inner.current = None;
                        return;
                    }
                }
            };

            let result = self.sink.play(&item.text).await;
            if let Err(err) = &result {
                // The failed item is dropped and the next one is attempted;
                // a broken line must not stall the queue.
                warn!(error = %err, "playback failed for item: {}", item.text);
            }

            self.inner.lock().unwrap().current = None;
            item.finish(result);
        }
    }

    /// Purge a session's pending items. Safe to call repeatedly and for
    /// sessions that never enqueued anything. Releases the sink when the
    /// queue ends up fully idle.
    pub fn teardown(&self, session_id: &str) {
        let (removed, idle) = {
            let mut inner = self.inner.lock().unwrap();
            let mut removed = Vec::new();
            let mut kept = VecDeque::new();
            while let Some(item) = inner.pending.pop_front() {
                if item.session_id.as_deref() == Some(session_id) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            inner.pending = kept;

            // The `playing` flag belongs to the drain loop; it clears it
            // itself when the pending list runs out.
            let idle = inner.pending.is_empty() && inner.current.is_none() && !inner.playing;
            (removed, idle)
        };

        for item in removed {
            item.finish(Err(PlaybackError("session ended".to_string())));
        }

        if idle {
            let sink = Arc::clone(&self.sink);
            tokio::spawn(async move { sink.release().await });
        }
    }

    /// Number of pending (not yet playing) items.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a drain loop is currently active.
    pub fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Sink that records every played line and blocks until the test
    /// releases a permit, so tests control exactly when playback finishes.
    struct GatedSink {
        gate: Semaphore,
        played: Mutex<Vec<String>>,
        fail_on: Option<String>,
        released: AtomicUsize,
    }

    impl GatedSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                played: Mutex::new(Vec::new()),
                fail_on: None,
                released: AtomicUsize::new(0),
            })
        }

        fn failing_on(text: &str) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                played: Mutex::new(Vec::new()),
                fail_on: Some(text.to_string()),
                released: AtomicUsize::new(0),
            })
        }

        fn release_one(&self) {
            self.gate.add_permits(1);
        }

        fn played(&self) -> Vec<String> {
            self.played.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AudioSink for GatedSink {
        async fn play(&self, text: &str) -> Result<(), PlaybackError> {
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.played.lock().unwrap().push(text.to_string());
            if self.fail_on.as_deref() == Some(text) {
                return Err(PlaybackError("synthetic failure".to_string()));
            }
            Ok(())
        }

        async fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn drain(queue: &Arc<AudioPlaybackQueue>) {
        for _ in 0..200 {
            if !queue.is_playing() && queue.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test]
    async fn plays_items_in_fifo_order() {
        let sink = GatedSink::new();
        let queue = Arc::new(AudioPlaybackQueue::new(5, sink.clone()));

        queue.enqueue(QueueItem::new("first"));
        queue.enqueue(QueueItem::new("second"));
        queue.enqueue(QueueItem::new("third"));

        for _ in 0..3 {
            sink.release_one();
        }
        drain(&queue).await;

        assert_eq!(sink.played(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn duplicate_text_is_not_queued_twice() {
        let sink = GatedSink::new();
        let queue = Arc::new(AudioPlaybackQueue::new(5, sink.clone()));

        queue.enqueue(QueueItem::new("same line"));
        // Let the drain loop claim the first item.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(QueueItem::new("same line"));

        // The duplicate was dropped against the currently-playing text.
        assert_eq!(queue.len(), 0);

        sink.release_one();
        drain(&queue).await;
        assert_eq!(sink.played(), vec!["same line"]);
    }

    #[tokio::test]
    async fn duplicate_callback_resolves_immediately() {
        let sink = GatedSink::new();
        let queue = Arc::new(AudioPlaybackQueue::new(5, sink.clone()));
        let (tx, rx) = tokio::sync::oneshot::channel();

        queue.enqueue(QueueItem::new("line"));
        queue.enqueue(QueueItem::new("line").on_end(Box::new(move |result| {
            let _ = tx.send(result.is_ok());
        })));

        // The duplicate's callback fires without any playback happening.
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn over_capacity_evicts_oldest_pending() {
        let sink = GatedSink::new();
        let queue = Arc::new(AudioPlaybackQueue::new(2, sink.clone()));

        // "a" starts playing and leaves the pending list.
        queue.enqueue(QueueItem::new("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.enqueue(QueueItem::new("b"));
        queue.enqueue(QueueItem::new("c"));
        assert_eq!(queue.len(), 2);

        // "b2" evicts "b", the oldest pending item, never the playing one.
        queue.enqueue(QueueItem::new("b2"));
        assert_eq!(queue.len(), 2);

        for _ in 0..3 {
            sink.release_one();
        }
        drain(&queue).await;
        assert_eq!(sink.played(), vec!["a", "c", "b2"]);
    }

    #[tokio::test]
    async fn evicted_item_callback_gets_an_error() {
        let sink = GatedSink::new();
        let queue = Arc::new(AudioPlaybackQueue::new(1, sink.clone()));

        queue.enqueue(QueueItem::new("playing"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        queue.enqueue(QueueItem::new("victim").on_end(Box::new(move |r| {
            let _ = tx.send(r.is_err());
        })));
        queue.enqueue(QueueItem::new("newer"));

        assert!(rx.await.unwrap(), "evicted item should see an error");
    }

    #[tokio::test]
    async fn failed_item_does_not_stall_the_queue() {
        let sink = GatedSink::failing_on("broken");
        let queue = Arc::new(AudioPlaybackQueue::new(5, sink.clone()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        queue.enqueue(QueueItem::new("broken").on_end(Box::new(move |r| {
            let _ = tx.send(r.is_err());
        })));
        queue.enqueue(QueueItem::new("next"));

        sink.release_one();
        sink.release_one();
        drain(&queue).await;

        assert!(rx.await.unwrap(), "failure must reach the callback");
        assert_eq!(sink.played(), vec!["broken", "next"]);
    }

    #[tokio::test]
    async fn teardown_purges_only_that_sessions_items() {
        let sink = GatedSink::new();
        let queue = Arc::new(AudioPlaybackQueue::new(5, sink.clone()));

        queue.enqueue(QueueItem::new("playing").for_session("s1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.enqueue(QueueItem::new("mine").for_session("s1"));
        queue.enqueue(QueueItem::new("theirs").for_session("s2"));

        queue.teardown("s1");
        assert_eq!(queue.len(), 1);

        sink.release_one();
        sink.release_one();
        drain(&queue).await;
        assert_eq!(sink.played(), vec!["playing", "theirs"]);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_safe_without_items() {
        let sink = GatedSink::new();
        let queue = Arc::new(AudioPlaybackQueue::new(5, sink.clone()));

        // Never enqueued anything; teardown must still be a successful no-op.
        queue.teardown("ghost");
        queue.teardown("ghost");
        assert!(queue.is_empty());
        assert!(!queue.is_playing());

        // Idle teardown releases the sink.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.released.load(Ordering::SeqCst) >= 2);
    }
}
