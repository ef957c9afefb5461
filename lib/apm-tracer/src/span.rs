use std::collections::HashMap;

use serde::Serialize;

/// Metric key used by the Datadog Agent to read the sampling decision of a trace.
pub(crate) const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";

/// A closed span, in the shape expected by the Datadog Agent trace intake.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FinishedSpan {
    /// Identifier shared by every span of the same trace.
    pub trace_id: u64,

    /// Identifier of this span.
    pub span_id: u64,

    /// Identifier of the parent span, or zero for a root span.
    pub parent_id: u64,

    /// Service the span belongs to.
    pub service: String,

    /// Operation name.
    pub name: String,

    /// Resource being operated on, such as an endpoint or a cache key.
    pub resource: String,

    /// Span type, such as `web` or `redis`.
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub span_type: String,

    /// Start time, in nanoseconds since the Unix epoch.
    pub start: i64,

    /// Duration, in nanoseconds.
    pub duration: i64,

    /// Whether or not the span is marked as errored (`1`) or not (`0`).
    pub error: i32,

    /// String tags.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,

    /// Numeric tags.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
}

impl FinishedSpan {
    /// Returns `true` if this span is the root of its trace.
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }

    /// Returns the value of the given string tag, if it exists.
    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

/// A complete trace: every span sharing a trace ID, in the order they were closed.
///
/// The root span is always last.
pub type Trace = Vec<FinishedSpan>;
