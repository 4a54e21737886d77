//! Sync engine: one delta fetch plus concurrent gap catch-up.
//!
//! A delta fetch reports, per room, the newest slice of the timeline.
//! When the server truncated that slice (`limited`), the events between
//! the previously known cursor and the slice are missing and must be
//! recovered by paging backward from the slice's `prev_batch` token.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use roomline_core::{ClientError, Cursor, Event, Filter, SyncBatch, TimelineFilter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wire::{MessagesOptions, MessagesPage, SyncResponse};

/// Default server-side long-poll wait for steady-state polling.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport surface the sync engine drives.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// One delta fetch with a server-side wait timeout.
    async fn delta_fetch(
        &self,
        since: Option<&Cursor>,
        filter: Option<&Filter>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncResponse, ClientError>;

    /// One pagination call.
    async fn paginate(
        &self,
        room_id: &str,
        options: MessagesOptions,
    ) -> Result<MessagesPage, ClientError>;
}

/// Turns delta fetches plus out-of-band pagination into gap-free,
/// chronologically ordered per-room event sequences.
pub struct SyncEngine<T> {
    transport: std::sync::Arc<T>,
}

impl<T> Clone for SyncEngine<T> {
    fn clone(&self) -> Self {
        Self {
            transport: std::sync::Arc::clone(&self.transport),
        }
    }
}

impl<T: SyncTransport> SyncEngine<T> {
    pub fn new(transport: std::sync::Arc<T>) -> Self {
        Self { transport }
    }

    /// Perform one synchronization cycle.
    ///
    /// Fails only when the delta fetch itself fails; a catch-up failure
    /// for one room drops that room from the batch and is logged, not
    /// propagated.
    pub async fn sync_once(
        &self,
        since: Option<&Cursor>,
        filter: Option<&Filter>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncBatch, ClientError> {
        let response = self
            .transport
            .delta_fetch(since, filter, timeout, cancel)
            .await?;

        let mut events: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        let mut gaps: Vec<(String, Cursor)> = Vec::new();

        for (room_id, delta) in response.rooms.join {
            if delta.timeline.events.is_empty() {
                continue;
            }
            if delta.timeline.limited {
                match delta.timeline.prev_batch.clone() {
                    Some(prev_batch) => gaps.push((room_id.clone(), prev_batch)),
                    None => warn!(room = %room_id, "limited delta without prev_batch token"),
                }
            }
            events.insert(room_id, delta.timeline.events);
        }

        if !gaps.is_empty() {
            let timeline_filter = filter.and_then(Filter::timeline);
            let jobs = gaps.into_iter().map(|(room_id, prev_batch)| async move {
                let result = self
                    .catch_up(&room_id, since, prev_batch, timeline_filter)
                    .await;
                (room_id, result)
            });

            for (room_id, result) in join_all(jobs).await {
                match result {
                    Ok(mut recovered) => {
                        debug!(room = %room_id, events = recovered.len(), "closed history gap");
                        // Pagination walked backward; flip to oldest-first
                        // and put the recovered span before the live slice.
                        recovered.reverse();
                        if let Some(live) = events.remove(&room_id) {
                            recovered.extend(live);
                        }
                        events.insert(room_id, recovered);
                    }
                    Err(err) => {
                        warn!(room = %room_id, error = %err, "catch-up failed, dropping room from batch");
                        events.remove(&room_id);
                    }
                }
            }
        }

        Ok(SyncBatch {
            since: since.cloned(),
            next_batch: response.next_batch,
            events,
        })
    }

    /// Page backward from `from` until the gap down to `stop` is closed,
    /// returning the recovered events newest-first.
    ///
    /// The gap counts as closed when a page returns the stop token as
    /// its end, no end token at all, or no events; the transport's token
    /// values are never interpreted, only compared for identity.
    async fn catch_up(
        &self,
        room_id: &str,
        stop: Option<&Cursor>,
        from: Cursor,
        filter: Option<&TimelineFilter>,
    ) -> Result<Vec<Event>, ClientError> {
        let mut events = Vec::new();
        let mut from = from;

        loop {
            let options = MessagesOptions::backward(Some(from.clone()), stop.cloned())
                .with_filter(filter.cloned());
            let page = self.transport.paginate(room_id, options).await?;

            let exhausted = page.chunk.is_empty();
            events.extend(page.chunk);

            match page.end {
                Some(end) if Some(&end) != stop && !exhausted => from = end,
                _ => break,
            }
        }

        Ok(events)
    }
}
