//! Query parameters accepted by each metric

use super::{RequestSignature, BASE_FIELDS};
use crate::{Error, Result};
use tracing::debug;

/// Parameters every metric accepts
pub const COMMON_PARAMS: &[&str] = &[
    "date_start",
    "date_end",
    "project",
    "namespace",
    "interval",
    "time_series",
    "aggregator",
];

/// Metric names served by the metrics API
pub const KNOWN_METRICS: &[&str] = &[
    "blocks",
    "bytes_added",
    "edit_count",
    "edit_rate",
    "live_account",
    "namespace_edits",
    "revert_rate",
    "survival",
    "threshold",
    "time_to_threshold",
];

fn metric_specific_params(metric: &str) -> Option<&'static [&'static str]> {
    let params: &'static [&'static str] = match metric {
        "blocks" | "bytes_added" | "edit_count" | "namespace_edits" => &[],
        "edit_rate" => &["time_unit", "time_unit_count"],
        "live_account" => &["t"],
        "revert_rate" => &["look_back", "look_ahead"],
        "survival" => &["restrict", "t"],
        "threshold" => &["restrict", "t", "n"],
        "time_to_threshold" => &["threshold_type"],
        _ => return None,
    };
    Some(params)
}

/// Optional parameters accepted by `metric`, `None` for unknown metrics
pub fn accepted_params(metric: &str) -> Option<Vec<&'static str>> {
    let specific = metric_specific_params(metric)?;
    Some(COMMON_PARAMS.iter().chain(specific).copied().collect())
}

/// Copy of `signature` keeping only base fields and the parameters its
/// metric accepts.
pub fn restrict_to_metric(signature: &RequestSignature) -> Result<RequestSignature> {
    let metric = signature
        .present("metric")
        .ok_or_else(|| Error::InvalidSignature {
            field: "metric".to_string(),
        })?;
    let accepted =
        accepted_params(metric).ok_or_else(|| Error::NotFound(format!("metric '{}'", metric)))?;

    let mut restricted = RequestSignature::new();
    for (name, value) in signature.fields() {
        if BASE_FIELDS.contains(&name) || accepted.contains(&name) {
            restricted.set(name, value);
        } else {
            debug!("Metric '{}' does not accept parameter '{}'", metric, name);
        }
    }
    Ok(restricted)
}
