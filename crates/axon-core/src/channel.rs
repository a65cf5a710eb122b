// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-producer, single-consumer fan-in for stream events.
//!
//! Any number of named producers — cooperative generator tasks and direct
//! pushers — feed one queue; a single consumer drains it in arrival order.
//! Exactly one generator is the "main" producer: its return value becomes the
//! channel's main result, its failure closes the channel.  Non-main failures
//! are swallowed (logged) so a crashed background child never tears down the
//! run that spawned it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use axon_types::{EngineError, StreamEvent};

use crate::outcome::DriveOutcome;

/// Completion report of one registered generator.
#[derive(Debug)]
pub struct GeneratorResult {
    pub result: Option<DriveOutcome>,
    pub error: Option<String>,
}

/// Terminal state observed by the consumer after the stream ends.
#[derive(Debug, Default)]
pub struct ChannelResult {
    pub main_result: Option<DriveOutcome>,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    pub thrown_error: Option<EngineError>,
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<StreamEvent>,
    direct_producers: usize,
    live_generators: usize,
    closed: bool,
    aborted: bool,
    abort_reason: Option<String>,
    main_result: Option<DriveOutcome>,
    thrown_error: Option<EngineError>,
}

struct ChannelInner {
    state: Mutex<ChannelState>,
    notify: Notify,
    cancel: CancellationToken,
}

/// The in-memory event channel.  Clones share the same queue.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

/// Push-only handle held by producers.  Pushing after close or abort is a
/// silent no-op — late events from winding-down producers are dropped, not
/// errors.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<ChannelInner>,
}

impl EventSink {
    pub fn push(&self, event: StreamEvent) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed || state.aborted {
            return;
        }
        state.queue.push_back(event);
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

/// Lifecycle handle for a registered direct producer.  Dropping the handle
/// completes it.
pub struct Producer {
    sink: EventSink,
    completed: bool,
}

impl Producer {
    pub fn push(&self, event: StreamEvent) {
        self.sink.push(event);
    }

    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let mut state = self.sink.inner.state.lock().unwrap();
        state.direct_producers = state.direct_producers.saturating_sub(1);
        drop(state);
        self.sink.inner.notify.notify_waiters();
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.finish();
    }
}

impl EventChannel {
    /// Create a channel wired to `cancel`: aborting the channel trips the
    /// token, and an externally tripped token terminates the consumer.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState::default()),
                notify: Notify::new(),
                cancel,
            }),
        }
    }

    /// The cancellation token shared with every producer.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// A push-only handle.
    pub fn sink(&self) -> EventSink {
        EventSink {
            inner: self.inner.clone(),
        }
    }

    /// Register a direct producer.  Fails once the channel has closed or
    /// aborted.
    pub fn register_producer(&self) -> Result<Producer, EngineError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed || state.aborted {
            return Err(EngineError::ChannelClosed);
        }
        state.direct_producers += 1;
        Ok(Producer {
            sink: self.sink(),
            completed: false,
        })
    }

    /// Attach a cooperative generator task.  `make` receives a sink whose
    /// pushes become channel events; the returned future's output is reported
    /// through the returned receiver (and, for the main producer, becomes the
    /// channel's main result).
    ///
    /// A main producer error closes the channel and surfaces as
    /// `thrown_error`; a non-main error is logged and dropped.  A main result
    /// in the yielded state closes the channel immediately, regardless of
    /// other producers.
    pub fn register_generator<F, Fut>(
        &self,
        id: impl Into<String>,
        is_main: bool,
        make: F,
    ) -> Result<oneshot::Receiver<GeneratorResult>, EngineError>
    where
        F: FnOnce(EventSink) -> Fut,
        Fut: Future<Output = Result<DriveOutcome, EngineError>> + Send + 'static,
    {
        let id = id.into();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed || state.aborted {
                return Err(EngineError::ChannelClosed);
            }
            state.live_generators += 1;
        }

        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let fut = make(self.sink());
        tokio::spawn(async move {
            let outcome = fut.await;
            let report = {
                let mut state = inner.state.lock().unwrap();
                state.live_generators = state.live_generators.saturating_sub(1);
                match outcome {
                    Ok(outcome) => {
                        if is_main {
                            if outcome.is_yielded() {
                                // A suspended main producer ends the stream at
                                // once; background producers are released.
                                state.closed = true;
                            }
                            state.main_result = Some(outcome.clone());
                        }
                        GeneratorResult {
                            result: Some(outcome),
                            error: None,
                        }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        if is_main {
                            state.thrown_error = Some(err);
                            state.closed = true;
                        } else {
                            warn!(producer = %id, error = %message, "producer failed; dropping error");
                        }
                        GeneratorResult {
                            result: None,
                            error: Some(message),
                        }
                    }
                }
            };
            let _ = tx.send(report);
            inner.notify.notify_waiters();
        });
        Ok(rx)
    }

    /// Mark the channel aborted.  The consumer observes termination at its
    /// next poll; producers see the tripped cancellation token and are
    /// expected to return early.
    pub fn abort(&self, reason: Option<String>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed || state.aborted {
                return;
            }
            state.aborted = true;
            state.abort_reason = reason;
        }
        debug!("channel aborted");
        self.inner.cancel.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Receive the next event.  `None` means the stream has terminated:
    /// aborted, or closed with every producer finished and the queue drained.
    pub async fn recv(&self) -> Option<StreamEvent> {
        loop {
            // Arm the waiter before inspecting state so a push between the
            // check and the await cannot be lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.aborted {
                    return None;
                }
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed
                    || (state.direct_producers == 0 && state.live_generators == 0)
                {
                    state.closed = true;
                    return None;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.cancel.cancelled() => {
                    let mut state = self.inner.state.lock().unwrap();
                    if !state.closed {
                        state.aborted = true;
                    }
                }
            }
        }
    }

    /// Take the terminal result.  Meaningful after `recv` has returned
    /// `None`.
    pub fn take_result(&self) -> ChannelResult {
        let mut state = self.inner.state.lock().unwrap();
        ChannelResult {
            main_result: state.main_result.take(),
            aborted: state.aborted,
            abort_reason: state.abort_reason.take(),
            thrown_error: state.thrown_error.take(),
        }
    }

    /// Release all producers and drop queued items.
    pub fn cleanup(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.queue.clear();
        state.direct_producers = 0;
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use axon_types::{Event, Usage};

    use super::*;

    fn channel() -> EventChannel {
        EventChannel::new(CancellationToken::new())
    }

    fn text_event(text: &str) -> StreamEvent {
        StreamEvent::Event(Event::user(text, None))
    }

    fn event_text(ev: &StreamEvent) -> String {
        match ev {
            StreamEvent::Event(e) => match &e.payload {
                axon_types::EventPayload::User { text, .. } => text.clone(),
                _ => panic!("unexpected payload"),
            },
            _ => panic!("unexpected stream event"),
        }
    }

    #[tokio::test]
    async fn direct_producer_events_arrive_in_order() {
        let ch = channel();
        let p = ch.register_producer().unwrap();
        p.push(text_event("one"));
        p.push(text_event("two"));
        p.complete();

        assert_eq!(event_text(&ch.recv().await.unwrap()), "one");
        assert_eq!(event_text(&ch.recv().await.unwrap()), "two");
        assert!(ch.recv().await.is_none());
    }

    #[tokio::test]
    async fn main_generator_result_is_captured() {
        let ch = channel();
        let rx = ch
            .register_generator("main", true, |sink| async move {
                sink.push(text_event("from-main"));
                Ok(DriveOutcome::completed(None, 2, Usage::default()))
            })
            .unwrap();

        assert_eq!(event_text(&ch.recv().await.unwrap()), "from-main");
        assert!(ch.recv().await.is_none());

        let report = rx.await.unwrap();
        assert_eq!(report.result.unwrap().iterations, 2);

        let result = ch.take_result();
        assert_eq!(result.main_result.unwrap().iterations, 2);
        assert!(!result.aborted);
        assert!(result.thrown_error.is_none());
    }

    #[tokio::test]
    async fn two_producers_interleave_preserving_per_producer_order() {
        let ch = channel();
        let n = 5usize;
        for name in ["a", "b"] {
            ch.register_generator(name, name == "a", move |sink| async move {
                for i in 0..n {
                    sink.push(text_event(&format!("{name}{i}")));
                    tokio::task::yield_now().await;
                }
                Ok(DriveOutcome::completed(None, 0, Usage::default()))
            })
            .unwrap();
        }

        let mut seen = Vec::new();
        while let Some(ev) = ch.recv().await {
            seen.push(event_text(&ev));
        }
        assert_eq!(seen.len(), 2 * n);
        for name in ["a", "b"] {
            let only: Vec<&String> = seen.iter().filter(|s| s.starts_with(name)).collect();
            assert_eq!(only.len(), n, "{name}: {seen:?}");
            for (i, s) in only.iter().enumerate() {
                assert_eq!(**s, format!("{name}{i}"));
            }
        }
    }

    #[tokio::test]
    async fn non_main_error_is_swallowed() {
        let ch = channel();
        ch.register_generator("main", true, |sink| async move {
            // Give the failing sibling a chance to run first.
            tokio::task::yield_now().await;
            sink.push(text_event("still-alive"));
            Ok(DriveOutcome::completed(None, 0, Usage::default()))
        })
        .unwrap();
        let rx = ch
            .register_generator("bad", false, |_sink| async move {
                Err(EngineError::Model("boom".into()))
            })
            .unwrap();

        assert_eq!(event_text(&ch.recv().await.unwrap()), "still-alive");
        assert!(ch.recv().await.is_none());

        let report = rx.await.unwrap();
        assert_eq!(report.error.as_deref(), Some("model error: boom"));
        let result = ch.take_result();
        assert!(result.thrown_error.is_none(), "non-main errors must not close the channel");
        assert!(result.main_result.is_some());
    }

    #[tokio::test]
    async fn main_error_sets_thrown_error() {
        let ch = channel();
        ch.register_generator("main", true, |_sink| async move {
            Err(EngineError::Model("fatal".into()))
        })
        .unwrap();

        assert!(ch.recv().await.is_none());
        let result = ch.take_result();
        assert!(result.thrown_error.is_some());
        assert!(result.main_result.is_none());
    }

    #[tokio::test]
    async fn yielded_main_result_closes_immediately() {
        let ch = channel();
        // A background producer that would keep the channel open forever.
        ch.register_generator("slow", false, |sink| async move {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            sink.push(text_event("too-late"));
            Ok(DriveOutcome::completed(None, 0, Usage::default()))
        })
        .unwrap();
        ch.register_generator("main", true, |_sink| async move {
            Ok(DriveOutcome::yielded(vec![], true, 1, Usage::default()))
        })
        .unwrap();

        // Terminates promptly despite the sleeping producer.
        let ended = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while ch.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "channel must close once the main producer yields");
        assert!(ch.take_result().main_result.unwrap().is_yielded());
    }

    #[tokio::test]
    async fn abort_terminates_consumer_with_reason() {
        let ch = channel();
        let p = ch.register_producer().unwrap();
        p.push(text_event("before"));

        ch.abort(Some("cancel".into()));
        // At most one further event before the terminal result; this
        // implementation terminates immediately.
        assert!(ch.recv().await.is_none());

        let result = ch.take_result();
        assert!(result.aborted);
        assert_eq!(result.abort_reason.as_deref(), Some("cancel"));
    }

    #[tokio::test]
    async fn abort_propagates_to_generators_via_token() {
        let ch = channel();
        let token = ch.cancellation_token();
        let rx = ch
            .register_generator("main", true, move |_sink| async move {
                token.cancelled().await;
                Ok(DriveOutcome::aborted(0, Usage::default()))
            })
            .unwrap();

        ch.abort(None);
        let report = tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .expect("generator should observe the abort")
            .unwrap();
        assert_eq!(
            report.result.unwrap().status,
            axon_types::RunStatus::Aborted
        );
    }

    #[tokio::test]
    async fn register_after_close_fails() {
        let ch = channel();
        ch.cleanup();
        assert!(matches!(
            ch.register_producer(),
            Err(EngineError::ChannelClosed)
        ));
        assert!(ch
            .register_generator("late", false, |_s| async move {
                Ok(DriveOutcome::completed(None, 0, Usage::default()))
            })
            .is_err());
    }

    #[tokio::test]
    async fn cleanup_drops_queued_items() {
        let ch = channel();
        let p = ch.register_producer().unwrap();
        p.push(text_event("queued"));
        ch.cleanup();
        assert!(ch.recv().await.is_none());
    }

    #[tokio::test]
    async fn external_token_cancel_terminates_consumer() {
        let token = CancellationToken::new();
        let ch = EventChannel::new(token.clone());
        let _p = ch.register_producer().unwrap();

        let ch2 = ch.clone();
        let consumer = tokio::spawn(async move { ch2.recv().await });
        tokio::task::yield_now().await;
        token.cancel();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake on cancel")
            .unwrap();
        assert!(got.is_none());
        assert!(ch.take_result().aborted);
    }
}
