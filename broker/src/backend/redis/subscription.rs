//! Per-subscription Redis reader
//!
//! Each subscription runs one loop calling `XREADGROUP` with `COUNT 1` and a
//! short block, so cancellation is noticed within the block window without
//! tearing down the in-flight read. Pending messages (cursor `"0"`) are
//! processed first; on EOF the cursor switches to `">"` for new messages.
//! Acknowledgment happens after the dispatcher returns, from the same task
//! that ran the dispatch.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use virta_core::Event;

use super::super::{BACKEND_ID_ATTRIBUTE, ConsumerDispatcher, SubscriptionStatusChange};
use super::CE_KEY;
use crate::status::{SubscriptionState, SubscriptionStatus};

/// How long a single XREADGROUP may block server-side.
const READ_BLOCK: Duration = Duration::from_secs(3);

/// Cursor for pending (read but unacknowledged) messages.
const PENDING_CURSOR: &str = "0";

/// Cursor for new messages.
const NEW_CURSOR: &str = ">";

/// A position in a Redis stream: `<millis>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct StreamPosition {
    pub millis: u64,
    pub seq: u64,
}

impl StreamPosition {
    /// Parse `"millis-seq"`; a bare `"millis"` gets sequence zero.
    pub fn parse(id: &str) -> Option<Self> {
        let (millis, seq) = match id.split_once('-') {
            Some((m, s)) => (m.parse().ok()?, s.parse().ok()?),
            None => (id.parse().ok()?, 0),
        };
        Some(Self { millis, seq })
    }

    pub fn to_stream_id(self) -> String {
        format!("{}-{}", self.millis, self.seq)
    }

    /// Exclusive upper bound check: when the message id reaches the bound the
    /// message is not dispatched.
    pub fn exceeded_by(self, id: &str) -> bool {
        match Self::parse(id) {
            Some(position) => position >= self,
            // Unparseable ids should not happen; fail open so the
            // subscription keeps draining rather than stalling.
            None => false,
        }
    }
}

pub(super) struct RedisSubscription {
    pub client: ConnectionManager,
    pub stream: String,
    pub group: String,
    pub name: String,
    pub instance: String,

    /// Exclusive end of the replay window, when bounded.
    pub end_bound: Option<StreamPosition>,

    pub tracking_enabled: bool,

    pub dispatcher: ConsumerDispatcher,
    pub status: SubscriptionStatusChange,

    pub cancel: CancellationToken,
    pub stopped: CancellationToken,
}

impl RedisSubscription {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        // Start by draining messages this group read but never acknowledged.
        let mut cursor = PENDING_CURSOR.to_string();
        let mut exit_loop = false;

        while !exit_loop && !self.cancel.is_cancelled() {
            // The blocking read is bounded by READ_BLOCK, so a cancelled
            // token is noticed promptly without dropping an in-flight read.
            let options = StreamReadOptions::default()
                .group(&self.group, &self.instance)
                .count(1)
                .block(READ_BLOCK.as_millis() as usize);

            let reply: StreamReadReply = match self
                .client
                .xread_options(&[&self.stream], &[&cursor], &options)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    // A nil reply just means the block elapsed without data.
                    if e.kind() != redis::ErrorKind::TypeError && !e.is_timeout() {
                        error!(group = %self.group, error = %e,
                            "error reading CloudEvents from consumer group");
                    }
                    continue;
                }
            };

            let Some(key) = reply.keys.into_iter().next() else {
                // EOF on the pending range: switch to new messages.
                if cursor != NEW_CURSOR {
                    cursor = NEW_CURSOR.to_string();
                }
                continue;
            };

            if key.ids.is_empty() && cursor != NEW_CURSOR {
                cursor = NEW_CURSOR.to_string();
                continue;
            }

            for message in key.ids {
                let Some(event) = self.decode(&message).await else {
                    continue;
                };

                // Once the id reaches the end bound the subscription is
                // complete; the bound itself is exclusive.
                if let Some(end) = self.end_bound {
                    if end.exceeded_by(&message.id) {
                        (self.status)(SubscriptionStatus::new(SubscriptionState::Complete));
                        exit_loop = true;
                        break;
                    }
                }

                let mut event = event;
                if self.tracking_enabled {
                    event.set_extension(BACKEND_ID_ATTRIBUTE, message.id.clone());
                }

                // Dispatch on its own task to keep the read loop hot; the ACK
                // waits on the dispatcher.
                let dispatcher = self.dispatcher.clone();
                let mut ack_conn = self.client.clone();
                let stream = self.stream.clone();
                let group = self.group.clone();
                let message_id = message.id.clone();
                let event_id = event.id.clone();
                tokio::spawn(async move {
                    dispatcher(event).await;
                    let acked: redis::RedisResult<i64> =
                        ack_conn.xack(&stream, &group, &[&message_id]).await;
                    if let Err(e) = acked {
                        error!(message_id = %message_id, event_id = %event_id, error = %e,
                            "could not ACK the Redis message");
                    }
                });

                // While draining pending messages the ACK may lag; advance
                // the cursor so the next read does not return this message.
                if cursor != NEW_CURSOR {
                    cursor = message.id.clone();
                }
            }
        }

        debug!(group = %self.group, instance = %self.instance, stream = %self.stream,
            "exited Redis subscription");
        self.stopped.cancel();
    }

    /// Extract and validate the CloudEvent from a stream entry. Entries
    /// without a valid event are acknowledged so they are not redelivered.
    async fn decode(&mut self, message: &redis::streams::StreamId) -> Option<Event> {
        let mut found = None;
        for (key, value) in &message.map {
            if key != CE_KEY {
                debug!(key = %key, "ignoring unexpected key at message from backend");
                continue;
            }
            match redis::from_redis_value::<Vec<u8>>(value) {
                Ok(raw) => found = Some(raw),
                Err(e) => {
                    error!(message_id = %message.id, error = %e,
                        "unreadable payload in stream entry");
                }
            }
        }

        let event = found
            .and_then(|raw| Event::from_json(&raw).ok())
            .filter(|event| event.validate().is_ok());

        if event.is_none() {
            warn!(message_id = %message.id, "removing non CloudEvent message from backend");
            let acked: redis::RedisResult<i64> = self
                .client
                .xack(&self.stream, &self.group, &[&message.id])
                .await;
            if let Err(e) = acked {
                error!(message_id = %message.id, error = %e,
                    "could not ACK the Redis message containing a non valid CloudEvent");
            }
        }
        event
    }
}
