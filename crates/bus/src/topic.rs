//! Topic derivation from provider label maps.
//!
//! Publishers and subscribers never exchange topic names: both sides derive
//! the same string independently from the provider's labels.

use std::collections::BTreeMap;

/// Canonical topic for a label map: keys sorted, `k=v` pairs joined with
/// commas (`role=processor,stage=final`). A `BTreeMap` input is already
/// sorted, so the serialization is deterministic.
pub fn topic_for_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
