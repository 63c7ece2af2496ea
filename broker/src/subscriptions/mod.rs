//! Subscription management
//!
//! The manager reconciles incoming configuration snapshots against the set
//! of live subscribers: removed triggers are unsubscribed, new ones get a
//! subscriber and a backend subscription, changed ones have their delivery
//! context swapped in place. Reconciliation runs under an exclusive lock so
//! overlapping snapshots cannot interleave.

pub mod delivery;
mod subscriber;

pub use delivery::{DeliveryOutcome, DeliverySender, RetryPolicy};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::backend::Backend;
use crate::config::{BrokerConfig, ConfigCallback};
use crate::status::{StatusManager, SubscriptionState, SubscriptionStatus};

use subscriber::Subscriber;

pub struct SubscriptionManager {
    backend: Arc<dyn Backend>,
    status: StatusManager,
    sender: DeliverySender,

    /// Live subscribers by trigger name. The lock spans whole reconciles.
    subscribers: Mutex<HashMap<String, Arc<Subscriber>>>,
}

impl SubscriptionManager {
    pub fn new(backend: Arc<dyn Backend>, status: StatusManager) -> Self {
        Self {
            backend,
            status,
            sender: DeliverySender::new(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Adapter for the config sources: snapshots are applied asynchronously
    /// in arrival order (the reconcile lock serializes them).
    pub fn config_callback(self: &Arc<Self>) -> ConfigCallback {
        let manager = self.clone();
        Arc::new(move |config: &BrokerConfig| {
            let manager = manager.clone();
            let config = config.clone();
            tokio::spawn(async move {
                manager.update_from_config(&config).await;
            });
        })
    }

    /// Reconcile the live subscriber set against a configuration snapshot.
    pub async fn update_from_config(&self, config: &BrokerConfig) {
        let mut subscribers = self.subscribers.lock().await;

        // Drop subscriptions that are gone from the configuration.
        let removed: Vec<String> = subscribers
            .keys()
            .filter(|name| !config.triggers.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            self.backend.unsubscribe(&name).await;
            subscribers.remove(&name);
            self.status.ensure_no_subscription(&name);
        }

        for (name, trigger) in &config.triggers {
            match subscribers.get(name) {
                None => {
                    let subscriber = match Subscriber::new(
                        name,
                        trigger,
                        self.backend.clone(),
                        self.status.clone(),
                        self.sender.clone(),
                    ) {
                        Ok(subscriber) => Arc::new(subscriber),
                        Err(e) => {
                            error!(trigger = %name, error = %e, "could not set up trigger");
                            self.status.ensure_subscription(
                                name,
                                SubscriptionStatus::new(SubscriptionState::Failed)
                                    .with_message(e.to_string()),
                            );
                            continue;
                        }
                    };

                    let subscribed = self
                        .backend
                        .subscribe(
                            name,
                            trigger.bounds.as_ref(),
                            subscriber.dispatcher(),
                            subscriber.status_callback(),
                        )
                        .await;
                    if let Err(e) = subscribed {
                        error!(trigger = %name, error = %e, "could not subscribe trigger");
                        self.status.ensure_subscription(
                            name,
                            SubscriptionStatus::new(SubscriptionState::Failed)
                                .with_message(e.to_string()),
                        );
                        continue;
                    }

                    subscribers.insert(name.clone(), subscriber);
                    self.status
                        .ensure_subscription(name, SubscriptionStatus::new(SubscriptionState::Ready));
                }
                Some(subscriber) => {
                    if subscriber.trigger() == *trigger {
                        // No changes for this trigger.
                        continue;
                    }

                    // Bounds changes are not applied to a running
                    // subscription; filter and delivery options take effect
                    // immediately.
                    info!(trigger = %name, "updating trigger configuration");
                    if let Err(e) = subscriber.update_trigger(trigger) {
                        error!(trigger = %name, error = %e, "could not update trigger");
                        self.status.ensure_subscription(
                            name,
                            SubscriptionStatus::new(SubscriptionState::Failed)
                                .with_message(e.to_string()),
                        );
                    }
                }
            }
        }
    }

    /// Names of the currently live subscriptions, mainly for tests and
    /// probes.
    pub async fn subscription_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscribers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
