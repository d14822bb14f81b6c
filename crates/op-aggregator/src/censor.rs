use std::sync::LazyLock;

use op_core::types::{Span, STACKTRACE_LABEL};
use regex::Regex;

/// Labels carrying raw query results or bound values.
const DROPPED_LABELS: [&str; 4] = ["result", "results", "value", "values"];

/// Replacement for anything that looks like an embedded JSON object.
pub const REDACTED: &str = "{}";

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{.*\}").expect("json object pattern is valid"));

/// Strip payload contents and volatile identifiers from spans before they
/// are aggregated. Stack traces are left intact for source resolution.
pub fn censor_spans(spans: &mut [Span]) {
    for span in spans {
        span.span_id = None;
        span.parent_span_id = None;

        let Some(labels) = span.labels.as_mut() else {
            continue;
        };
        for key in DROPPED_LABELS {
            labels.remove(key);
        }
        for (key, value) in labels.iter_mut() {
            if key == STACKTRACE_LABEL || !value.contains('{') {
                continue;
            }
            let redacted = JSON_OBJECT.replace_all(value, REDACTED).into_owned();
            *value = redacted;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
