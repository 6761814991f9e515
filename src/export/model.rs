//! The Cloud Trace v1 upload payload.
//!
//! Field names and spellings follow the service's JSON schema: ids are hex
//! (traces) and unsigned integers (spans), timestamps are RFC 3339 strings
//! with nanosecond precision, and a `parentSpanId` of 0 marks a root within
//! the payload.

use std::collections::HashMap;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// The body of a trace upload request: a list of traces.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Traces {
    /// The traces in this upload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<Trace>,
}

/// One trace: a set of spans sharing a trace id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    /// Cloud project the trace belongs to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    /// Trace identifier, 32 hex digits.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    /// The spans of the trace, in finish order with the root last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<TraceSpan>,
}

/// One span within an uploaded trace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    /// What kind of work the span describes.
    #[serde(default, skip_serializing_if = "SpanKind::is_unspecified")]
    pub kind: SpanKind,
    /// Human-readable span name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Nonzero span identifier, unique within the trace.
    #[serde(default)]
    pub span_id: u64,
    /// Identifier of the parent span; 0 marks a root within this payload.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub parent_span_id: u64,
    /// When the work started.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_time: String,
    /// When the work finished.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub end_time: String,
    /// Free-form key/value annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// The kind of work a span describes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal work that is neither side of an RPC.
    #[default]
    #[serde(rename = "SPAN_KIND_UNSPECIFIED")]
    Unspecified,
    /// Handling an inbound request.
    #[serde(rename = "RPC_SERVER")]
    Server,
    /// Performing an outbound call.
    #[serde(rename = "RPC_CLIENT")]
    Client,
}

impl SpanKind {
    fn is_unspecified(&self) -> bool {
        *self == SpanKind::Unspecified
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Render a timestamp the way the service expects it.
pub(crate) fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true)
}
