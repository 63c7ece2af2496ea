//! Per-trigger subscriber
//!
//! One subscriber exists per configured trigger. It owns the materialized
//! filter tree and the delivery context (target URL + retry policy) built
//! from the trigger, dispatches events handed over by the backend reader,
//! routes failures to the dead-letter sink and re-ingests reply events.

use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error};

use virta_core::Event;

use crate::backend::{Backend, ConsumerDispatcher, SubscriptionStatusChange};
use crate::config::Trigger;
use crate::error::Result;
use crate::filter::FilterExpr;
use crate::status::{StatusManager, SubscriptionState, SubscriptionStatus};

use super::delivery::{DeliveryOutcome, DeliverySender, RetryPolicy};

/// Delivery view of a trigger, rebuilt atomically on every trigger change.
struct DeliveryContext {
    trigger: Trigger,
    filter: FilterExpr,
    target: Option<String>,
    retry: Option<RetryPolicy>,
    dead_letter: Option<String>,
}

pub(super) struct Subscriber {
    name: String,
    backend: Arc<dyn Backend>,
    status: StatusManager,
    sender: DeliverySender,

    /// Swapped whole on update; dispatches snapshot it under the read lock,
    /// so in-flight deliveries keep targeting the context they started with.
    context: RwLock<Arc<DeliveryContext>>,
}

impl Subscriber {
    pub fn new(
        name: &str,
        trigger: &Trigger,
        backend: Arc<dyn Backend>,
        status: StatusManager,
        sender: DeliverySender,
    ) -> Result<Self> {
        let context = Self::build_context(trigger)?;
        Ok(Self {
            name: name.to_string(),
            backend,
            status,
            sender,
            context: RwLock::new(Arc::new(context)),
        })
    }

    pub fn trigger(&self) -> Trigger {
        self.context.read().trigger.clone()
    }

    /// Apply a trigger change. The context is rebuilt first so a bad update
    /// (e.g. unparseable backoff delay) leaves the previous one in place.
    pub fn update_trigger(&self, trigger: &Trigger) -> Result<()> {
        let context = Self::build_context(trigger)?;
        *self.context.write() = Arc::new(context);
        Ok(())
    }

    fn build_context(trigger: &Trigger) -> Result<DeliveryContext> {
        let retry = RetryPolicy::from_options(trigger.delivery_options())?;
        Ok(DeliveryContext {
            trigger: trigger.clone(),
            filter: FilterExpr::from_filters(&trigger.filters),
            target: trigger.target.url.clone().filter(|url| !url.is_empty()),
            retry,
            dead_letter: trigger
                .delivery_options()
                .and_then(|options| options.dead_letter_url.clone())
                .filter(|url| !url.is_empty()),
        })
    }

    /// The backend-facing dispatch callback.
    pub fn dispatcher(self: &Arc<Self>) -> ConsumerDispatcher {
        let subscriber = self.clone();
        Arc::new(move |event| {
            let subscriber = subscriber.clone();
            async move { subscriber.dispatch(event).await }.boxed()
        })
    }

    /// The backend-facing status callback.
    pub fn status_callback(self: &Arc<Self>) -> SubscriptionStatusChange {
        let status = self.status.clone();
        let name = self.name.clone();
        Arc::new(move |update: SubscriptionStatus| {
            status.ensure_subscription(&name, update);
        })
    }

    async fn dispatch(&self, event: Event) {
        let context = self.context.read().clone();

        self.dispatch_with(&context, &event).await;

        // Every handled event counts as processed, filtered ones included.
        let mut update = SubscriptionStatus::new(SubscriptionState::Running);
        update.last_processed = Some(chrono::Utc::now());
        self.status.ensure_subscription(&self.name, update);
    }

    async fn dispatch_with(&self, context: &DeliveryContext, event: &Event) {
        if !context.filter.evaluate(event) {
            debug!(trigger = %self.name, id = %event.id, "skipped delivery due to filter");
            return;
        }

        // Only try to send if a target URL has been configured. When not
        // configured, route straight to the dead-letter sink.
        if let Some(url) = &context.target {
            if self.send(url, event, context.retry.as_ref()).await {
                return;
            }
        }

        // The dead-letter sink gets a single attempt: the retry budget
        // applies to the target only.
        if let Some(dls) = &context.dead_letter {
            if self.send(dls, event, None).await {
                return;
            }
        }

        // Nowhere left to go; leave a queryable trace of the loss.
        let target = context.target.as_deref().unwrap_or("");
        error!(lost = true, trigger = %self.name, ty = %event.ty, source = %event.source,
            id = %event.id, target, "event was lost");
        if let Some(metrics) = crate::metrics::Metrics::get() {
            metrics
                .events_lost
                .with_label_values(&[self.name.as_str()])
                .inc();
        }
    }

    /// Send with retries. Returns true when the event is settled: accepted,
    /// and its reply (if any) ingested back into the broker.
    async fn send(&self, url: &str, event: &Event, retry: Option<&RetryPolicy>) -> bool {
        match self.sender.send(url, event, retry).await {
            DeliveryOutcome::Ack(None) => true,
            DeliveryOutcome::Ack(Some(reply)) => {
                if let Err(e) = self.backend.produce(&reply).await {
                    // Not ingesting the response is considered a failure.
                    error!(url, error = %e, ty = %reply.ty, source = %reply.source,
                        id = %reply.id, "failed to consume response");
                    return false;
                }
                true
            }
            DeliveryOutcome::Undelivered => {
                error!(url, ty = %event.ty, source = %event.source, id = %event.id,
                    "failed to send event");
                false
            }
            DeliveryOutcome::Nack => {
                error!(url, ty = %event.ty, source = %event.source, id = %event.id,
                    "event not accepted");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{BackoffPolicy, DeliveryOptions, Filter, Target};
    use std::collections::BTreeMap;

    fn trigger(url: Option<&str>) -> Trigger {
        Trigger {
            target: Target {
                url: url.map(String::from),
                delivery_options: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn context_builds_from_trigger() {
        let mut t = trigger(Some("http://sink:9090"));
        t.filters = vec![Filter {
            exact: BTreeMap::from([("type".to_string(), "a".to_string())]),
            ..Default::default()
        }];
        t.delivery_options = Some(DeliveryOptions {
            retry: Some(2),
            backoff_policy: Some(BackoffPolicy::Constant),
            backoff_delay: Some("PT1S".to_string()),
            dead_letter_url: Some("http://dlq".to_string()),
        });

        let context = Subscriber::build_context(&t).unwrap();
        assert_eq!(context.target.as_deref(), Some("http://sink:9090"));
        assert_eq!(context.dead_letter.as_deref(), Some("http://dlq"));
        assert_eq!(context.retry.as_ref().unwrap().retries, 2);
        assert!(!matches!(context.filter, FilterExpr::Pass));
    }

    #[test]
    fn empty_target_url_means_no_target() {
        let context = Subscriber::build_context(&trigger(Some(""))).unwrap();
        assert!(context.target.is_none());
    }

    #[test]
    fn bad_backoff_delay_fails_the_context() {
        let mut t = trigger(Some("http://sink"));
        t.delivery_options = Some(DeliveryOptions {
            retry: Some(1),
            backoff_policy: Some(BackoffPolicy::Linear),
            backoff_delay: Some("soon".to_string()),
            dead_letter_url: None,
        });
        assert!(Subscriber::build_context(&t).is_err());
    }
}
