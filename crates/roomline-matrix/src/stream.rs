//! Continuous streaming wrapper around the sync engine.
//!
//! One producer task repeatedly polls; the caller consumes batches and
//! errors through a channel receiver. Cancelling the token aborts the
//! backoff wait and any in-flight poll and closes the sequence.

use std::time::Duration;

use roomline_core::{ClientError, Cursor, ErrorCategory, Filter, RetryPolicy, SyncBatch};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::{SyncEngine, SyncTransport, DEFAULT_POLL_TIMEOUT};

const BATCH_CHANNEL_CAPACITY: usize = 8;

/// Filter input for a stream: absent, fixed, or recomputed per poll to
/// react to room-set changes.
pub enum FilterSource {
    None,
    Fixed(Filter),
    Provider(Box<dyn Fn() -> Filter + Send + Sync>),
}

impl FilterSource {
    pub fn provider(provider: impl Fn() -> Filter + Send + Sync + 'static) -> Self {
        Self::Provider(Box::new(provider))
    }

    fn current(&self) -> Option<Filter> {
        match self {
            Self::None => None,
            Self::Fixed(filter) => Some(filter.clone()),
            Self::Provider(provider) => Some(provider()),
        }
    }
}

impl Default for FilterSource {
    fn default() -> Self {
        Self::None
    }
}

impl From<Filter> for FilterSource {
    fn from(filter: Filter) -> Self {
        Self::Fixed(filter)
    }
}

/// Consumer handle of a running stream.
///
/// The sequence ends (yields `None`) after cancellation or when the
/// producer task stops; a new stream must be created to resume.
pub struct SyncStream {
    batches: mpsc::Receiver<Result<SyncBatch, ClientError>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncStream {
    /// Receive the next batch or error; `None` once the stream ended.
    pub async fn next(&mut self) -> Option<Result<SyncBatch, ClientError>> {
        self.batches.recv().await
    }

    /// Signal the producer to stop after the current suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the producer task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Start a continuous stream of sync batches.
///
/// The first poll returns immediately (timeout zero); steady-state polls
/// long-poll with the default wait. On an error the driver yields it and
/// retries after an exponential backoff; a successful poll whose cursor
/// did not advance yields nothing and polls again right away.
pub fn stream<T>(
    engine: SyncEngine<T>,
    since: Option<Cursor>,
    filter: FilterSource,
    cancel: &CancellationToken,
) -> SyncStream
where
    T: SyncTransport + 'static,
{
    let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
    let stop = cancel.child_token();
    let task_stop = stop.clone();

    let task = tokio::spawn(async move {
        drive(engine, since, filter, batch_tx, task_stop).await;
    });

    SyncStream {
        batches: batch_rx,
        cancel: stop,
        task,
    }
}

async fn drive<T: SyncTransport>(
    engine: SyncEngine<T>,
    since: Option<Cursor>,
    filter: FilterSource,
    batches: mpsc::Sender<Result<SyncBatch, ClientError>>,
    stop: CancellationToken,
) {
    let policy = RetryPolicy::default();
    let mut cursor = since;
    let mut attempt: u32 = 0;
    let mut retry_hint: Option<u64> = None;
    // The initial poll is an immediate catch-up; pacing afterwards comes
    // from the server-side long-poll wait, not from client delays.
    let mut poll_timeout = Duration::ZERO;

    loop {
        let delay = policy.delay_for_attempt(attempt, retry_hint);
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "backing off before next poll");
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let filter = filter.current();
        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = engine.sync_once(cursor.as_ref(), filter.as_ref(), poll_timeout, &stop) => result,
        };

        match result {
            Ok(batch) => {
                attempt = 0;
                retry_hint = None;
                poll_timeout = DEFAULT_POLL_TIMEOUT;

                if cursor.as_ref() == Some(&batch.next_batch) {
                    // No new events; the long poll already paced us.
                    continue;
                }
                cursor = Some(batch.next_batch.clone());
                if batches.send(Ok(batch)).await.is_err() {
                    break;
                }
            }
            Err(err) if err.category == ErrorCategory::Cancelled => break,
            Err(err) => {
                warn!(error = %err, "poll failed");
                retry_hint = err.retry_after_ms;
                attempt = attempt.saturating_add(1);
                if batches.send(Err(err)).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("sync stream stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use roomline_core::Event;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::wire::{MessagesOptions, MessagesPage, SyncResponse};

    enum Script {
        Respond(Result<SyncResponse, ClientError>),
        /// Park until cancelled, then surface the cancellation error.
        BlockUntilCancelled,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        deltas: Mutex<VecDeque<Script>>,
        call_times: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn push(&self, step: Script) {
            self.deltas.lock().expect("deltas lock").push_back(step);
        }

        fn call_times(&self) -> Vec<Instant> {
            self.call_times.lock().expect("times lock").clone()
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn delta_fetch(
            &self,
            _since: Option<&Cursor>,
            _filter: Option<&Filter>,
            _timeout: Duration,
            cancel: &CancellationToken,
        ) -> Result<SyncResponse, ClientError> {
            self.call_times.lock().expect("times lock").push(Instant::now());
            let step = self
                .deltas
                .lock()
                .expect("deltas lock")
                .pop_front()
                .unwrap_or(Script::BlockUntilCancelled);
            match step {
                Script::Respond(result) => result,
                Script::BlockUntilCancelled => {
                    cancel.cancelled().await;
                    Err(ClientError::cancelled("delta fetch"))
                }
            }
        }

        async fn paginate(
            &self,
            _room_id: &str,
            _options: MessagesOptions,
        ) -> Result<MessagesPage, ClientError> {
            Err(ClientError::new(
                ErrorCategory::Internal,
                "unexpected_paginate",
                "stream tests never paginate",
            ))
        }
    }

    fn response(next_batch: &str, with_event: bool) -> SyncResponse {
        let rooms = if with_event {
            json!({ "join": { "!r1:example.org": { "timeline": {
                "events": [ { "type": "m.room.message", "sender": "@a:example.org",
                              "event_id": format!("$e-{next_batch}"), "content": {} } ],
                "limited": false
            } } } })
        } else {
            json!({ "join": {} })
        };
        serde_json::from_value(json!({ "next_batch": next_batch, "rooms": rooms }))
            .expect("response should deserialize")
    }

    fn first_event_id(batch: &SyncBatch) -> Option<String> {
        batch
            .events
            .values()
            .flat_map(|events| events.iter())
            .filter_map(|event: &Event| event.event_id.clone())
            .next()
    }

    #[tokio::test(start_paused = true)]
    async fn yields_batches_and_advances_the_cursor() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Script::Respond(Ok(response("CUR2", true))));
        transport.push(Script::Respond(Ok(response("CUR3", true))));

        let cancel = CancellationToken::new();
        let mut stream = stream(
            SyncEngine::new(Arc::clone(&transport)),
            Some(Cursor::from("CUR1")),
            FilterSource::None,
            &cancel,
        );

        let first = stream
            .next()
            .await
            .expect("stream should yield")
            .expect("first poll should succeed");
        assert_eq!(first.since, Some(Cursor::from("CUR1")));
        assert_eq!(first.next_batch, Cursor::from("CUR2"));
        assert_eq!(first_event_id(&first).as_deref(), Some("$e-CUR2"));

        let second = stream
            .next()
            .await
            .expect("stream should yield")
            .expect("second poll should succeed");
        assert_eq!(second.since, Some(Cursor::from("CUR2")));
        assert_eq!(second.next_batch, Cursor::from("CUR3"));

        stream.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_cursor_is_skipped_without_delay() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Script::Respond(Ok(response("CUR1", false))));
        transport.push(Script::Respond(Ok(response("CUR2", true))));

        let cancel = CancellationToken::new();
        let mut stream = stream(
            SyncEngine::new(Arc::clone(&transport)),
            Some(Cursor::from("CUR1")),
            FilterSource::None,
            &cancel,
        );

        let yielded = stream
            .next()
            .await
            .expect("stream should yield")
            .expect("poll should succeed");
        assert_eq!(yielded.next_batch, Cursor::from("CUR2"));

        // Both polls happened back to back; the no-op one was silent.
        let times = transport.call_times();
        assert!(times.len() >= 2);
        assert_eq!(times[1] - times[0], Duration::ZERO);

        stream.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_yielded_and_retried_with_exponential_backoff() {
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..3 {
            transport.push(Script::Respond(Err(ClientError::new(
                ErrorCategory::Network,
                "offline",
                "connection refused",
            ))));
        }
        transport.push(Script::Respond(Ok(response("CUR2", true))));

        let cancel = CancellationToken::new();
        let mut stream = stream(
            SyncEngine::new(Arc::clone(&transport)),
            Some(Cursor::from("CUR1")),
            FilterSource::None,
            &cancel,
        );

        for _ in 0..3 {
            let err = stream
                .next()
                .await
                .expect("stream should yield")
                .expect_err("scripted failures should surface");
            assert_eq!(err.code, "offline");
        }
        stream
            .next()
            .await
            .expect("stream should yield")
            .expect("recovery poll should succeed");

        let times = transport.call_times();
        assert!(times.len() >= 4);
        assert_eq!(times[1] - times[0], Duration::from_millis(1_000));
        assert_eq!(times[2] - times[1], Duration::from_millis(2_000));
        assert_eq!(times[3] - times[2], Duration::from_millis(4_000));

        stream.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_backoff_counter() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Script::Respond(Err(ClientError::new(
            ErrorCategory::Network,
            "offline",
            "flaky",
        ))));
        transport.push(Script::Respond(Ok(response("CUR2", true))));
        transport.push(Script::Respond(Err(ClientError::new(
            ErrorCategory::Network,
            "offline",
            "flaky again",
        ))));
        transport.push(Script::Respond(Ok(response("CUR3", true))));

        let cancel = CancellationToken::new();
        let mut stream = stream(
            SyncEngine::new(Arc::clone(&transport)),
            Some(Cursor::from("CUR1")),
            FilterSource::None,
            &cancel,
        );

        for _ in 0..4 {
            let _ = stream.next().await.expect("stream should yield");
        }

        let times = transport.call_times();
        assert!(times.len() >= 4);
        // Delays: error -> 1s, success -> 0, error -> back to 1s.
        assert_eq!(times[1] - times[0], Duration::from_millis(1_000));
        assert_eq!(times[2] - times[1], Duration::ZERO);
        assert_eq!(times[3] - times[2], Duration::from_millis(1_000));

        stream.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hints_stretch_the_backoff() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Script::Respond(Err(ClientError::new(
            ErrorCategory::RateLimited,
            "M_LIMIT_EXCEEDED",
            "slow down",
        )
        .with_retry_after(Duration::from_secs(5)))));
        transport.push(Script::Respond(Ok(response("CUR2", true))));

        let cancel = CancellationToken::new();
        let mut stream = stream(
            SyncEngine::new(Arc::clone(&transport)),
            Some(Cursor::from("CUR1")),
            FilterSource::None,
            &cancel,
        );

        let _ = stream.next().await.expect("error should be yielded");
        let _ = stream.next().await.expect("recovery should be yielded");

        let times = transport.call_times();
        assert!(times.len() >= 2);
        assert_eq!(times[1] - times[0], Duration::from_secs(5));

        stream.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_mid_poll_ends_the_sequence() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Script::BlockUntilCancelled);

        let cancel = CancellationToken::new();
        let mut stream = stream(
            SyncEngine::new(Arc::clone(&transport)),
            Some(Cursor::from("CUR1")),
            FilterSource::None,
            &cancel,
        );

        // Let the producer reach the in-flight poll, then cancel.
        tokio::task::yield_now().await;
        cancel.cancel();

        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn filter_provider_is_consulted_on_every_poll() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Script::Respond(Ok(response("CUR2", true))));
        transport.push(Script::Respond(Ok(response("CUR3", true))));

        let calls = Arc::new(Mutex::new(0_u32));
        let calls_in_provider = Arc::clone(&calls);
        let source = FilterSource::provider(move || {
            *calls_in_provider.lock().expect("calls lock") += 1;
            Filter::default()
        });

        let cancel = CancellationToken::new();
        let mut stream = stream(
            SyncEngine::new(Arc::clone(&transport)),
            Some(Cursor::from("CUR1")),
            source,
            &cancel,
        );

        let _ = stream.next().await.expect("first yield");
        let _ = stream.next().await.expect("second yield");
        assert!(*calls.lock().expect("calls lock") >= 2);

        stream.stop().await;
    }
}
