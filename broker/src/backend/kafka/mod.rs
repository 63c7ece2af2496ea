//! Kafka backend
//!
//! The log is a single topic; record values hold the JSON-serialized
//! CloudEvent, records carry no key. Producing goes through one shared
//! `FutureProducer`; every subscription creates its own `StreamConsumer`
//! with consumer group `<group_prefix>.<name>` and commits offsets manually
//! after dispatch.

mod subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use virta_core::Event;

use super::{
    Backend, BackendInfo, ConsumerDispatcher, SubscriptionStatusChange, DISCONNECT_TIMEOUT,
    UNSUBSCRIBE_TIMEOUT,
};
use crate::config::TriggerBounds;
use crate::error::{BrokerError, Result};

use subscription::{EndBound, KafkaSubscription};

/// Producer delivery timeout.
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for metadata and offset lookups during subscribe.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct KafkaArgs {
    /// Seed broker addresses.
    pub addresses: Vec<String>,
    /// Topic used as the event log.
    pub topic: String,
    /// Prefix for per-subscription consumer groups.
    pub group_prefix: String,
    /// Static group membership id, unique per broker instance.
    pub instance: String,
    /// Stamp dispatched events with their offset.
    pub tracking_id_enabled: bool,
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartBound {
    /// From "now": only records produced after the subscription exists.
    Latest,
    /// From an explicit offset, applied to every partition.
    AtOffset(i64),
    /// From the first offset at or after the given wall-clock time.
    AfterMillis(i64),
}

struct LiveSubscription {
    cancel: CancellationToken,
    stopped: CancellationToken,
}

pub struct KafkaBackend {
    args: KafkaArgs,
    producer: Mutex<Option<FutureProducer>>,
    subs: Mutex<HashMap<String, LiveSubscription>>,
    disconnecting: AtomicBool,
}

impl KafkaBackend {
    pub fn new(args: KafkaArgs) -> Self {
        Self {
            args,
            producer: Mutex::new(None),
            subs: Mutex::new(HashMap::new()),
            disconnecting: AtomicBool::new(false),
        }
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.args.addresses.join(","));
        config
    }

    fn producer(&self) -> Result<FutureProducer> {
        self.producer
            .lock()
            .clone()
            .ok_or_else(|| BrokerError::BackendInit("kafka backend not initialized".to_string()))
    }

    /// Create the consumer for a subscription and position it according to
    /// the start bound. Bounded starts use manual assignment over all of the
    /// topic's partitions; unbounded ones use group subscription.
    fn create_consumer(&self, group: &str, start: StartBound) -> Result<StreamConsumer> {
        let mut config = self.base_config();
        config
            .set("group.id", group)
            .set("group.instance.id", &self.args.instance)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest");

        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| BrokerError::Transport(format!("client for subscription could not be created: {e}")))?;

        match start {
            StartBound::Latest => {
                consumer
                    .subscribe(&[self.args.topic.as_str()])
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
            }
            StartBound::AtOffset(offset) => {
                let assignment = self.partition_list(&consumer, |_| Offset::Offset(offset))?;
                consumer
                    .assign(&assignment)
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
            }
            StartBound::AfterMillis(millis) => {
                let at_time = self.partition_list(&consumer, |_| Offset::Offset(millis))?;
                let resolved = consumer
                    .offsets_for_times(at_time, LOOKUP_TIMEOUT)
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
                consumer
                    .assign(&resolved)
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
            }
        }

        Ok(consumer)
    }

    fn partition_list(
        &self,
        consumer: &StreamConsumer,
        offset: impl Fn(i32) -> Offset,
    ) -> Result<TopicPartitionList> {
        let metadata = consumer
            .fetch_metadata(Some(&self.args.topic), LOOKUP_TIMEOUT)
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let partitions = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.args.topic)
            .map(|t| t.partitions().len() as i32)
            .unwrap_or(0);

        let mut list = TopicPartitionList::new();
        for partition in 0..partitions {
            list.add_partition_offset(&self.args.topic, partition, offset(partition))
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
        }
        Ok(list)
    }

    async fn unsubscribe_inner(&self, name: &str) {
        let Some(sub) = self.subs.lock().remove(name) else {
            info!(name, "unsubscribe was not needed since the subscription did not exist");
            return;
        };

        sub.cancel.cancel();
        match tokio::time::timeout(UNSUBSCRIBE_TIMEOUT, sub.stopped.cancelled()).await {
            Ok(()) => debug!(name, "graceful shutdown of subscription"),
            Err(_) => error!(name, timeout_s = UNSUBSCRIBE_TIMEOUT.as_secs(),
                "unsubscribing from Kafka timed out"),
        }
    }
}

#[async_trait]
impl Backend for KafkaBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo { name: "Kafka" }
    }

    async fn init(&self, _ctx: CancellationToken) -> Result<()> {
        let producer: FutureProducer = self
            .base_config()
            .create()
            .map_err(|e| BrokerError::BackendInit(format!("could not create kafka client: {e}")))?;
        *self.producer.lock() = Some(producer);

        self.probe().await
    }

    async fn produce(&self, event: &Event) -> Result<()> {
        if self.disconnecting.load(Ordering::SeqCst) {
            return Err(BrokerError::Closing);
        }

        let payload = event.to_json()?;
        let producer = self.producer()?;

        let record = FutureRecord::<(), Vec<u8>>::to(&self.args.topic).payload(&payload);
        let (_, offset) = producer
            .send(record, PRODUCE_TIMEOUT)
            .await
            .map_err(|(e, _)| {
                BrokerError::Transport(format!(
                    "could not produce CloudEvent to Kafka topic {:?}: {e}",
                    self.args.topic
                ))
            })?;

        debug!(source = %event.source, id = %event.id, offset,
            "CloudEvent produced to the backend");
        Ok(())
    }

    async fn subscribe(
        &self,
        name: &str,
        bounds: Option<&TriggerBounds>,
        dispatcher: ConsumerDispatcher,
        status: SubscriptionStatusChange,
    ) -> Result<()> {
        if self.disconnecting.load(Ordering::SeqCst) {
            return Err(BrokerError::Closing);
        }
        if self.subs.lock().contains_key(name) {
            return Err(BrokerError::DuplicateSubscription(name.to_string()));
        }

        // Bounds parse errors abort before any client is created.
        let (start, end_bound) = resolve_bounds(bounds)?;

        let group = format!("{}.{}", self.args.group_prefix, name);
        let consumer = self.create_consumer(&group, start)?;

        let cancel = CancellationToken::new();
        let stopped = CancellationToken::new();

        let reader = KafkaSubscription {
            consumer: Arc::new(consumer),
            topic: self.args.topic.clone(),
            group: group.clone(),
            instance: self.args.instance.clone(),
            end_bound,
            tracking_enabled: self.args.tracking_id_enabled,
            dispatcher,
            status,
            cancel: cancel.clone(),
            stopped: stopped.clone(),
        };
        reader.spawn();

        self.subs
            .lock()
            .insert(name.to_string(), LiveSubscription { cancel, stopped });

        info!(group = %group, instance = %self.args.instance, topic = %self.args.topic,
            "started Kafka consumer");
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) {
        self.unsubscribe_inner(name).await;
    }

    async fn start(&self, ctx: CancellationToken) -> Result<()> {
        ctx.cancelled().await;

        self.disconnecting.store(true, Ordering::SeqCst);

        let names: Vec<String> = self.subs.lock().keys().cloned().collect();
        let drain = async {
            for name in &names {
                self.unsubscribe_inner(name).await;
            }
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, drain).await.is_err() {
            error!(timeout_s = DISCONNECT_TIMEOUT.as_secs(),
                "disconnection from Kafka timed out");
        }

        *self.producer.lock() = None;
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        use rdkafka::producer::Producer;

        let producer = self.producer()?;
        // Metadata for the configured topic doubles as a liveness check.
        let topic = self.args.topic.clone();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), LOOKUP_TIMEOUT)
                .map(|_| ())
                .map_err(|e| BrokerError::Transport(format!("failed probing Kafka: {e}")))
        })
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?
    }
}

/// Resolve trigger bounds into a start position and an optional end bound.
/// `by_id` (offsets) takes precedence over `by_date`.
fn resolve_bounds(bounds: Option<&TriggerBounds>) -> Result<(StartBound, Option<EndBound>)> {
    let Some(bounds) = bounds else {
        return Ok((StartBound::Latest, None));
    };

    let by_id = bounds.by_id.as_ref();
    let by_date = bounds.by_date.as_ref();

    let start = if let Some(start) = by_id.and_then(|b| b.start()) {
        StartBound::AtOffset(
            start
                .parse()
                .map_err(|e| BrokerError::Bounds(format!("parsing bounds start id: {e}")))?,
        )
    } else if let Some(start) = by_date.and_then(|b| b.start()) {
        let parsed = chrono::DateTime::parse_from_rfc3339(start)
            .map_err(|e| BrokerError::Bounds(format!("parsing bounds start date: {e}")))?;
        StartBound::AfterMillis(parsed.timestamp_millis())
    } else {
        StartBound::Latest
    };

    let end_offset = by_id
        .and_then(|b| b.end())
        .map(|end| {
            end.parse::<i64>()
                .map_err(|e| BrokerError::Bounds(format!("parsing bounds end id: {e}")))
        })
        .transpose()?;
    let end_millis = by_date
        .and_then(|b| b.end())
        .map(|end| {
            chrono::DateTime::parse_from_rfc3339(end)
                .map(|t| t.timestamp_millis())
                .map_err(|e| BrokerError::Bounds(format!("parsing bounds end date: {e}")))
        })
        .transpose()?;

    let end_bound = if end_offset.is_none() && end_millis.is_none() {
        None
    } else {
        Some(EndBound {
            offset: end_offset,
            millis: end_millis,
        })
    };

    Ok((start, end_bound))
}
