//! Filter tree evaluation
//!
//! Triggers carry a list of filter expressions that is materialized once per
//! configuration change into a [`FilterExpr`] tree, then evaluated against
//! every event on the hot path with a single walk. No reflection, no string
//! scripting.
//!
//! Attribute lookup resolves core CloudEvents attributes first, then
//! extensions. A missing attribute fails the expression (except under `not`,
//! which negates the inner result).

use tracing::warn;

use virta_core::Event;

use crate::config::Filter;

/// A materialized filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// Vacuously true; what an empty dialect or empty filter list becomes.
    Pass,
    /// All attribute/value pairs match exactly (case-sensitive).
    Exact(Vec<(String, String)>),
    /// All attribute values start with the paired string.
    Prefix(Vec<(String, String)>),
    /// All attribute values end with the paired string.
    Suffix(Vec<(String, String)>),
    All(Vec<FilterExpr>),
    Any(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Materialize a trigger's filter list. The list is conjunctive: an event
    /// must pass every entry. An empty list passes everything.
    pub fn from_filters(filters: &[Filter]) -> Self {
        if filters.is_empty() {
            return FilterExpr::Pass;
        }
        FilterExpr::All(filters.iter().map(Self::from_filter).collect())
    }

    /// Materialize a single filter expression.
    ///
    /// The config validator rejects multi-dialect filters; if one slips
    /// through anyway the first dialect wins and a warning is logged.
    pub fn from_filter(filter: &Filter) -> Self {
        if has_multiple_dialects(filter) {
            warn!(?filter, "filter has multiple dialects set, using the first");
        }

        if !filter.exact.is_empty() {
            FilterExpr::Exact(pairs(&filter.exact))
        } else if !filter.prefix.is_empty() {
            FilterExpr::Prefix(pairs(&filter.prefix))
        } else if !filter.suffix.is_empty() {
            FilterExpr::Suffix(pairs(&filter.suffix))
        } else if !filter.all.is_empty() {
            FilterExpr::All(filter.all.iter().map(Self::from_filter).collect())
        } else if !filter.any.is_empty() {
            FilterExpr::Any(filter.any.iter().map(Self::from_filter).collect())
        } else if let Some(not) = &filter.not {
            FilterExpr::Not(Box::new(Self::from_filter(not)))
        } else {
            FilterExpr::Pass
        }
    }

    /// Evaluate against an event. Pure and total.
    pub fn evaluate(&self, event: &Event) -> bool {
        match self {
            FilterExpr::Pass => true,
            FilterExpr::Exact(pairs) => pairs
                .iter()
                .all(|(attr, value)| event.attribute(attr).as_deref() == Some(value.as_str())),
            FilterExpr::Prefix(pairs) => pairs.iter().all(|(attr, value)| {
                event
                    .attribute(attr)
                    .is_some_and(|v| v.starts_with(value.as_str()))
            }),
            FilterExpr::Suffix(pairs) => pairs.iter().all(|(attr, value)| {
                event
                    .attribute(attr)
                    .is_some_and(|v| v.ends_with(value.as_str()))
            }),
            FilterExpr::All(inner) => inner.iter().all(|f| f.evaluate(event)),
            FilterExpr::Any(inner) => inner.iter().any(|f| f.evaluate(event)),
            FilterExpr::Not(inner) => !inner.evaluate(event),
        }
    }
}

fn pairs(map: &std::collections::BTreeMap<String, String>) -> Vec<(String, String)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn has_multiple_dialects(filter: &Filter) -> bool {
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
        > 1
}
