use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Span kind emitted by the tracer for an incoming HTTP/RPC request.
pub const RPC_SERVER: &str = "RPC_SERVER";
/// Span kind emitted for an outgoing call.
pub const RPC_CLIENT: &str = "RPC_CLIENT";

/// Label carrying the request path on the root span.
pub const HTTP_PATH_LABEL: &str = "http/path";
/// Label carrying a raw stack trace, resolved to source context on ingestion.
pub const STACKTRACE_LABEL: &str = "stacktrace";

/// String labels attached to a span. Ordered so serialized output is stable.
pub type Labels = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// ProcessIdentity
// ---------------------------------------------------------------------------

/// Identity of a supervised process as reported on the event bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    #[serde(default)]
    pub pm_id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

impl ProcessIdentity {
    pub fn new(pm_id: i64, name: impl Into<String>) -> Self {
        Self {
            pm_id,
            name: name.into(),
            revision: None,
            server: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Span / Trace
// ---------------------------------------------------------------------------

/// One timed unit of work inside a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl Span {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Set start/end from a start instant and a duration in milliseconds.
    pub fn timed(mut self, start: DateTime<Utc>, duration_ms: i64) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(start + chrono::Duration::milliseconds(duration_ms));
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels
            .get_or_insert_with(Labels::new)
            .insert(key.into(), value.into());
        self
    }

    /// Duration in whole milliseconds, when both timestamps are present.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    pub fn is_rpc_server(&self) -> bool {
        self.kind.as_deref() == Some(RPC_SERVER)
    }

    /// Number of labels, ignoring the stack trace which is stripped once resolved.
    pub fn label_arity(&self) -> Option<usize> {
        self.labels.as_ref().map(|labels| {
            labels
                .keys()
                .filter(|k| k.as_str() != STACKTRACE_LABEL)
                .count()
        })
    }
}

/// One captured request: a root span followed by its children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    #[serde(default)]
    pub spans: Vec<Span>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl Trace {
    pub fn new(spans: Vec<Span>) -> Self {
        Self {
            spans,
            trace_id: None,
            project_id: None,
        }
    }

    pub fn root(&self) -> Option<&Span> {
        self.spans.first()
    }

    /// The request path carried by the root span, if any.
    pub fn http_path(&self) -> Option<&str> {
        self.root()?
            .labels
            .as_ref()?
            .get(HTTP_PATH_LABEL)
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
