//! In-memory backend
//!
//! A bounded channel acts as the log. Produce enqueues with a timeout; a
//! single reader loop drains the channel and fans out to every live
//! subscriber sequentially, so there is no per-subscriber buffering and no
//! replay: bounded subscriptions are rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use virta_core::Event;

use super::{
    Backend, BackendInfo, ConsumerDispatcher, SubscriptionStatusChange, UNSUBSCRIBE_TIMEOUT,
};
use crate::config::TriggerBounds;
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct MemoryArgs {
    /// Capacity of the event buffer.
    pub buffer_size: usize,
    /// How long produce may wait for buffer space.
    pub produce_timeout: Duration,
}

impl Default for MemoryArgs {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            produce_timeout: Duration::from_secs(1),
        }
    }
}

pub struct MemoryBackend {
    args: MemoryArgs,

    sender: Mutex<Option<mpsc::Sender<Event>>>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,

    /// Dispatchers by subscription name. A tokio lock so the fan-out loop can
    /// hold it across dispatch awaits; unsubscribe acquiring the write half
    /// then naturally waits for the in-flight dispatch to finish.
    subscribers: Arc<RwLock<HashMap<String, ConsumerDispatcher>>>,

    closing: AtomicBool,
}

impl MemoryBackend {
    pub fn new(args: MemoryArgs) -> Self {
        Self {
            args,
            sender: Mutex::new(None),
            receiver: Mutex::new(None),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            closing: AtomicBool::new(false),
        }
    }

    async fn fan_out(subscribers: &RwLock<HashMap<String, ConsumerDispatcher>>, event: Event) {
        let subs = subscribers.read().await;
        for dispatcher in subs.values() {
            dispatcher(event.clone()).await;
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo { name: "Memory" }
    }

    async fn init(&self, _ctx: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.args.buffer_size);
        *self.sender.lock() = Some(tx);
        *self.receiver.lock() = Some(rx);
        Ok(())
    }

    async fn produce(&self, event: &Event) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BrokerError::Closing);
        }

        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| BrokerError::BackendInit("memory backend not initialized".to_string()))?;

        match sender
            .send_timeout(event.clone(), self.args.produce_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(BrokerError::BufferFull {
                timeout: self.args.produce_timeout,
            }),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(BrokerError::Closing),
        }
    }

    async fn subscribe(
        &self,
        name: &str,
        bounds: Option<&TriggerBounds>,
        dispatcher: ConsumerDispatcher,
        _status: SubscriptionStatusChange,
    ) -> Result<()> {
        if bounds.is_some() {
            return Err(BrokerError::Bounds(
                "bounds not supported for memory backend".to_string(),
            ));
        }
        if self.closing.load(Ordering::SeqCst) {
            return Err(BrokerError::Closing);
        }

        let mut subs = self.subscribers.write().await;
        if subs.contains_key(name) {
            return Err(BrokerError::DuplicateSubscription(name.to_string()));
        }
        subs.insert(name.to_string(), dispatcher);
        debug!(name, "memory subscription added");
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) {
        // Acquiring the write half waits for an in-flight fan-out, which is
        // the only dispatch that can reference this subscriber.
        match tokio::time::timeout(UNSUBSCRIBE_TIMEOUT, self.subscribers.write()).await {
            Ok(mut subs) => {
                if subs.remove(name).is_none() {
                    info!(name, "unsubscribe was not needed since the subscription did not exist");
                }
            }
            Err(_) => {
                warn!(name, timeout_s = UNSUBSCRIBE_TIMEOUT.as_secs(),
                    "unsubscribing timed out waiting for in-flight dispatch");
                let subscribers = self.subscribers.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    subscribers.write().await.remove(&name);
                });
            }
        }
    }

    async fn start(&self, ctx: CancellationToken) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| BrokerError::BackendInit("memory backend not initialized".to_string()))?;

        loop {
            tokio::select! {
                maybe = receiver.recv() => match maybe {
                    Some(event) => Self::fan_out(&self.subscribers, event).await,
                    None => break,
                },
                _ = ctx.cancelled() => {
                    // Reject new events, then drain whatever is buffered
                    // through all subscribers before returning.
                    self.closing.store(true, Ordering::SeqCst);
                    drop(self.sender.lock().take());

                    while let Some(event) = receiver.recv().await {
                        Self::fan_out(&self.subscribers, event).await;
                    }
                    break;
                }
            }
        }

        info!("memory backend drained");
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}
