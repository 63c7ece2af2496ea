//! Broker configuration model
//!
//! A configuration snapshot carries optional ingest credentials plus the set
//! of triggers, keyed by name. Snapshots arrive from one of the config
//! sources (file watch, file poll, inline) already parsed and validated;
//! components receive them through registered callbacks and never re-parse.
//!
//! YAML and JSON are structurally identical here; `serde_yaml` handles both.

pub mod duration;
pub mod source;

pub use source::{ConfigCallback, FileConfigSource};

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Credentials for the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// Retry backoff shapes for event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    Constant,
    Linear,
    Exponential,
}

/// Delivery policy for a trigger: retry count, backoff shape and base delay,
/// and an optional dead-letter sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_policy: Option<BackoffPolicy>,

    /// ISO-8601 duration, e.g. `PT1S`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_delay: Option<String>,

    #[serde(
        default,
        rename = "deadLetterURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub dead_letter_url: Option<String>,
}

/// Delivery target of a trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Destination URL. May be empty to signal temporary unavailability, in
    /// which case events route straight to the dead-letter sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Deprecated, use the trigger's delivery options instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_options: Option<DeliveryOptions>,
}

/// One expression in a trigger's filter tree.
///
/// Exactly one dialect may be set. A filter with no dialect set evaluates to
/// pass, which is what an empty `filters:` list materializes to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// True if all nested expressions are true.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Filter>,

    /// True if at least one nested expression is true.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Filter>,

    /// True if the nested expression is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Filter>>,

    /// Case-sensitive equality on attribute values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exact: BTreeMap<String, String>,

    /// Attribute value starts with the given string.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prefix: BTreeMap<String, String>,

    /// Attribute value ends with the given string.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub suffix: BTreeMap<String, String>,
}

/// A start/end pair over the backend log. Half-open: `[start, end)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl Bounds {
    pub fn start(&self) -> Option<&str> {
        self.start.as_deref().filter(|s| !s.is_empty())
    }

    pub fn end(&self) -> Option<&str> {
        self.end.as_deref().filter(|s| !s.is_empty())
    }
}

/// Replay window for a trigger. `by_id` takes precedence over `by_date` when
/// both are supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_id: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_date: Option<Bounds>,
}

/// A named subscription description: filters + target + delivery policy,
/// optionally bounded to a replay window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,

    #[serde(default)]
    pub target: Target,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_options: Option<DeliveryOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<TriggerBounds>,
}

impl Trigger {
    /// Effective delivery options: the trigger-level field wins over the
    /// legacy location under `target`.
    pub fn delivery_options(&self) -> Option<&DeliveryOptions> {
        self.delivery_options
            .as_ref()
            .or(self.target.delivery_options.as_ref())
    }
}

/// A full broker configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestConfig>,

    #[serde(default)]
    pub triggers: HashMap<String, Trigger>,
}

/// Parse and validate a configuration snapshot from YAML or JSON.
pub fn parse(content: &str) -> Result<BrokerConfig> {
    let config: BrokerConfig =
        serde_yaml::from_str(content).map_err(|e| BrokerError::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Semantic validation on top of the structural parse.
pub fn validate(config: &BrokerConfig) -> Result<()> {
    let mut errs = Vec::new();

    if let Some(ingest) = &config.ingest {
        if !ingest.password.is_empty() && ingest.user.is_empty() {
            errs.push("ingest: user must be provided when password is informed".to_string());
        }
    }

    for (name, trigger) in &config.triggers {
        validate_target(name, &trigger.target, &mut errs);
        if let Some(options) = trigger.delivery_options() {
            validate_delivery_options(name, options, &mut errs);
        }
        for (i, filter) in trigger.filters.iter().enumerate() {
            validate_filter(&format!("triggers.{name}.filters[{i}]"), filter, &mut errs);
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(BrokerError::Config(errs.join("; ")))
    }
}

fn validate_target(name: &str, target: &Target, errs: &mut Vec<String>) {
    if let Some(url) = target.url.as_deref().filter(|u| !u.is_empty()) {
        if url::Url::parse(url).is_err() {
            errs.push(format!("triggers.{name}.target.url cannot be parsed: {url:?}"));
        }
    }
}

fn validate_delivery_options(name: &str, options: &DeliveryOptions, errs: &mut Vec<String>) {
    if let Some(dls) = options.dead_letter_url.as_deref().filter(|u| !u.is_empty()) {
        if url::Url::parse(dls).is_err() {
            errs.push(format!(
                "triggers.{name}.deliveryOptions.deadLetterURL cannot be parsed: {dls:?}"
            ));
        }
    }

    if let Some(delay) = options.backoff_delay.as_deref() {
        if let Err(e) = duration::parse_iso8601(delay) {
            errs.push(format!(
                "triggers.{name}.deliveryOptions.backoffDelay: {e}"
            ));
        }
    }
}

fn validate_filter(path: &str, filter: &Filter, errs: &mut Vec<String>) {
    if dialect_count(filter) > 1 {
        errs.push(format!(
            "{path}: multiple dialects found, filters can have only one dialect set"
        ));
    }

    validate_attribute_names(path, "exact", &filter.exact, errs);
    validate_attribute_names(path, "prefix", &filter.prefix, errs);
    validate_attribute_names(path, "suffix", &filter.suffix, errs);

    for (i, nested) in filter.all.iter().enumerate() {
        validate_filter(&format!("{path}.all[{i}]"), nested, errs);
    }
    for (i, nested) in filter.any.iter().enumerate() {
        validate_filter(&format!("{path}.any[{i}]"), nested, errs);
    }
    if let Some(nested) = &filter.not {
        validate_filter(&format!("{path}.not"), nested, errs);
    }
}

fn dialect_count(filter: &Filter) -> usize {
    [
        !filter.exact.is_empty(),
        !filter.prefix.is_empty(),
        !filter.suffix.is_empty(),
        !filter.all.is_empty(),
        !filter.any.is_empty(),
        filter.not.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count()
}

/// Only lowercase alphanumeric attribute names, starting with a letter.
#[allow(clippy::expect_used)]
fn attribute_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-z][a-z0-9]*$").expect("static pattern"))
}

fn validate_attribute_names(
    path: &str,
    dialect: &str,
    attrs: &BTreeMap<String, String>,
    errs: &mut Vec<String>,
) {
    for attr in attrs.keys() {
        if !attribute_name_pattern().is_match(attr) {
            errs.push(format!(
                "{path}.{dialect}: attribute name {attr:?} must start with a letter and can only contain lowercase alphanumeric"
            ));
        }
    }
}
