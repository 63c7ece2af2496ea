//! Event delivery over HTTP
//!
//! Sends CloudEvents to trigger targets and dead-letter sinks in structured
//! mode and classifies the outcome: acknowledged (possibly carrying a reply
//! event), rejected by the application, or undelivered after the retry
//! budget is exhausted.

use std::time::Duration;

use tracing::{debug, warn};

use virta_core::Event;

use crate::config::{BackoffPolicy, DeliveryOptions};
use crate::error::{BrokerError, Result};
use crate::http_binding;

/// Request timeout for a single delivery attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry schedule derived from a trigger's delivery options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; total attempts = retries + 1.
    pub retries: u32,
    pub policy: BackoffPolicy,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Build the policy for a trigger. Retries are enabled only when the
    /// options carry `retry >= 1` and a backoff policy; a backoff delay that
    /// fails to parse invalidates the whole update.
    pub fn from_options(options: Option<&DeliveryOptions>) -> Result<Option<Self>> {
        let Some(options) = options else {
            return Ok(None);
        };
        let (Some(retry), Some(policy)) = (options.retry, options.backoff_policy) else {
            return Ok(None);
        };
        if retry == 0 {
            return Ok(None);
        }

        let delay = match options.backoff_delay.as_deref() {
            Some(raw) => crate::config::duration::parse_iso8601(raw)
                .map_err(|e| BrokerError::Config(format!("backoff delay parsing: {e}")))?,
            None => Duration::from_secs(1),
        };

        Ok(Some(Self {
            retries: retry,
            policy,
            delay,
        }))
    }

    /// Delay before retry `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.policy {
            BackoffPolicy::Constant => self.delay,
            BackoffPolicy::Linear => self.delay * attempt,
            BackoffPolicy::Exponential => self.delay * 2u32.saturating_pow(attempt - 1),
        }
    }
}

/// Result of delivering one event to one URL.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The sink accepted the event, optionally answering with a reply event
    /// to re-ingest.
    Ack(Option<Box<Event>>),
    /// The sink rejected the event (non-2xx response).
    Nack,
    /// The event never reached the sink (transport error or timeout), after
    /// exhausting the retry budget.
    Undelivered,
}

/// HTTP sender shared by all subscribers.
#[derive(Clone)]
pub struct DeliverySender {
    client: reqwest::Client,
}

impl DeliverySender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Send `event` to `url`, retrying per `policy`. NACK responses consume
    /// retry attempts the same way transport errors do.
    pub async fn send(
        &self,
        url: &str,
        event: &Event,
        policy: Option<&RetryPolicy>,
    ) -> DeliveryOutcome {
        let attempts = policy.map(|p| p.retries + 1).unwrap_or(1);
        let mut outcome = DeliveryOutcome::Undelivered;

        for attempt in 0..attempts {
            if attempt > 0 {
                if let Some(policy) = policy {
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying delivery");
                    tokio::time::sleep(delay).await;
                }
            }

            outcome = self.attempt(url, event).await;
            match outcome {
                DeliveryOutcome::Ack(_) => return outcome,
                DeliveryOutcome::Nack | DeliveryOutcome::Undelivered => {}
            }
        }

        outcome
    }

    async fn attempt(&self, url: &str, event: &Event) -> DeliveryOutcome {
        let body = match event.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(url, error = %e, "event could not be serialized for delivery");
                return DeliveryOutcome::Undelivered;
            }
        };

        let response = self
            .client
            .post(url)
            .header(
                http::header::CONTENT_TYPE,
                http_binding::STRUCTURED_CONTENT_TYPE,
            )
            .body(body)
            .timeout(ATTEMPT_TIMEOUT)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(url, error = %e, "delivery attempt failed");
                return DeliveryOutcome::Undelivered;
            }
        };

        if !response.status().is_success() {
            debug!(url, status = %response.status(), "event not accepted");
            return DeliveryOutcome::Nack;
        }

        // A 2xx response may carry a reply CloudEvent in either binding mode.
        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                debug!(url, error = %e, "could not read response body, treating as empty ACK");
                return DeliveryOutcome::Ack(None);
            }
        };

        if body.is_empty() || !http_binding::is_cloudevent(&headers) {
            return DeliveryOutcome::Ack(None);
        }

        match http_binding::event_from_http(&headers, &body) {
            Ok(reply) => DeliveryOutcome::Ack(Some(Box::new(reply))),
            Err(e) => {
                warn!(url, error = %e, "ignoring malformed reply event");
                DeliveryOutcome::Ack(None)
            }
        }
    }
}

impl Default for DeliverySender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::DeliveryOptions;

    fn options(retry: Option<u32>, policy: Option<BackoffPolicy>, delay: Option<&str>) -> DeliveryOptions {
        DeliveryOptions {
            retry,
            backoff_policy: policy,
            backoff_delay: delay.map(String::from),
            dead_letter_url: None,
        }
    }

    #[test]
    fn no_options_means_no_retries() {
        assert!(RetryPolicy::from_options(None).unwrap().is_none());
        assert!(RetryPolicy::from_options(Some(&DeliveryOptions::default()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn zero_retries_disables_the_policy() {
        let opts = options(Some(0), Some(BackoffPolicy::Constant), Some("PT1S"));
        assert!(RetryPolicy::from_options(Some(&opts)).unwrap().is_none());
    }

    #[test]
    fn retry_without_policy_is_disabled() {
        let opts = options(Some(3), None, Some("PT1S"));
        assert!(RetryPolicy::from_options(Some(&opts)).unwrap().is_none());
    }

    #[test]
    fn bad_delay_invalidates_the_update() {
        let opts = options(Some(2), Some(BackoffPolicy::Constant), Some("2 minutes"));
        assert!(matches!(
            RetryPolicy::from_options(Some(&opts)),
            Err(BrokerError::Config(_))
        ));
    }

    #[test]
    fn constant_backoff_is_flat() {
        let opts = options(Some(3), Some(BackoffPolicy::Constant), Some("PT2S"));
        let policy = RetryPolicy::from_options(Some(&opts)).unwrap().unwrap();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let opts = options(Some(3), Some(BackoffPolicy::Linear), Some("PT1S"));
        let policy = RetryPolicy::from_options(Some(&opts)).unwrap().unwrap();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let opts = options(Some(4), Some(BackoffPolicy::Exponential), Some("PT1S"));
        let policy = RetryPolicy::from_options(Some(&opts)).unwrap().unwrap();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn missing_delay_defaults_to_one_second() {
        let opts = options(Some(1), Some(BackoffPolicy::Constant), None);
        let policy = RetryPolicy::from_options(Some(&opts)).unwrap().unwrap();
        assert_eq!(policy.delay, Duration::from_secs(1));
    }
}
