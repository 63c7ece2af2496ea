//! Per-subscription Kafka reader
//!
//! One poll loop per subscription. Records are decoded, checked against the
//! end bound and dispatched on their own task; the offset commit waits on the
//! dispatcher so redelivery remains possible until the event is processed.

use std::sync::Arc;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use virta_core::Event;

use super::super::{ConsumerDispatcher, SubscriptionStatusChange, BACKEND_ID_ATTRIBUTE};
use crate::status::{SubscriptionState, SubscriptionStatus};

/// Exclusive end of a replay window, on either or both dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct EndBound {
    pub offset: Option<i64>,
    pub millis: Option<i64>,
}

impl EndBound {
    /// True once a record falls outside the window.
    pub fn exceeded(&self, offset: i64, timestamp_millis: Option<i64>) -> bool {
        if let Some(end) = self.offset {
            if offset >= end {
                return true;
            }
        }
        if let (Some(end), Some(ts)) = (self.millis, timestamp_millis) {
            if ts > end {
                return true;
            }
        }
        false
    }
}

pub(super) struct KafkaSubscription {
    pub consumer: Arc<StreamConsumer>,
    pub topic: String,
    pub group: String,
    pub instance: String,

    pub end_bound: Option<EndBound>,
    pub tracking_enabled: bool,

    pub dispatcher: ConsumerDispatcher,
    pub status: SubscriptionStatusChange,

    pub cancel: CancellationToken,
    pub stopped: CancellationToken,
}

impl KafkaSubscription {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let mut exit_loop = false;

        while !exit_loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.consumer.recv() => received,
            };

            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    // Transient fetch errors resolve on the next poll;
                    // anything else would repeat here and is visible in logs.
                    error!(group = %self.group, error = %e, "event consumption error");
                    continue;
                }
            };

            let partition = message.partition();
            let offset = message.offset();
            let timestamp_millis = message.timestamp().to_millis();

            let event = message
                .payload()
                .and_then(|payload| Event::from_json(payload).ok())
                .filter(|event| event.validate().is_ok());
            let Some(mut event) = event else {
                // No ACK concept here: committing past the record drops it.
                warn!(offset, "removing non CloudEvent message from backend");
                self.commit(partition, offset);
                continue;
            };

            if let Some(end) = self.end_bound {
                if end.exceeded(offset, timestamp_millis) {
                    (self.status)(SubscriptionStatus::new(SubscriptionState::Complete));
                    exit_loop = true;
                    continue;
                }
            }

            if self.tracking_enabled {
                event.set_extension(BACKEND_ID_ATTRIBUTE, offset.to_string());
            }

            // Dispatch on its own task to keep the poll loop hot; the commit
            // waits on the dispatcher.
            let dispatcher = self.dispatcher.clone();
            let consumer = self.consumer.clone();
            let topic = self.topic.clone();
            let event_id = event.id.clone();
            tokio::spawn(async move {
                dispatcher(event).await;
                if let Err(e) = commit_record(&consumer, &topic, partition, offset) {
                    error!(offset, event_id = %event_id, error = %e,
                        "could not commit the Kafka offset");
                }
            });
        }

        debug!(group = %self.group, instance = %self.instance, topic = %self.topic,
            "exited Kafka subscription");
        self.stopped.cancel();
    }

    fn commit(&self, partition: i32, offset: i64) {
        if let Err(e) = commit_record(&self.consumer, &self.topic, partition, offset) {
            error!(offset, error = %e, "could not commit the Kafka offset");
        }
    }
}

fn commit_record(
    consumer: &StreamConsumer,
    topic: &str,
    partition: i32,
    offset: i64,
) -> rdkafka::error::KafkaResult<()> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
    consumer.commit(&list, CommitMode::Async)
}
