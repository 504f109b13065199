//! Shared helpers for provider adapters and their consumers.

use tb_domain::error::Error;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// finish_reason normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalize a provider's `finish_reason` to a lowercase string.
///
/// Some providers report the reason as an enum name (`"STOP"`,
/// `"tool_calls"`), others as a bare integer. Adapters call this before
/// emitting `StreamEvent::Done` so everything downstream sees one format.
pub fn normalize_finish_reason(raw: &serde_json::Value) -> Option<String> {
    match raw {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(s.to_ascii_lowercase())
            }
        }
        serde_json::Value::Number(n) => {
            // Integer codes used by some SDK enums.
            let name = match n.as_u64() {
                Some(0) => "unspecified",
                Some(1) => "stop",
                Some(2) => "max_tokens",
                Some(3) => "safety",
                Some(4) => "recitation",
                Some(5) => "other",
                _ => return Some(n.to_string()),
            };
            Some(name.to_string())
        }
        serde_json::Value::Null => None,
        other => Some(other.to_string().to_ascii_lowercase()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream failure classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal LLM stream failure classes the event streamer surfaces
/// with distinct user-visible messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFailure {
    QuotaExceeded,
    ServiceUnavailable,
    Internal,
}

/// Classify a terminal stream error into one of the failure classes.
pub fn classify_stream_error(err: &Error) -> StreamFailure {
    match err {
        Error::QuotaExceeded(_) => StreamFailure::QuotaExceeded,
        Error::ServiceUnavailable(_) => StreamFailure::ServiceUnavailable,
        other => {
            let msg = other.to_string().to_ascii_lowercase();
            if msg.contains("quota") || msg.contains("resource exhausted") || msg.contains("429") {
                StreamFailure::QuotaExceeded
            } else if msg.contains("unavailable") || msg.contains("503") || msg.contains("overloaded")
            {
                StreamFailure::ServiceUnavailable
            } else {
                StreamFailure::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_enum_name() {
        assert_eq!(normalize_finish_reason(&json!("STOP")).as_deref(), Some("stop"));
        assert_eq!(
            normalize_finish_reason(&json!("tool_calls")).as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn normalize_integer_codes() {
        assert_eq!(normalize_finish_reason(&json!(1)).as_deref(), Some("stop"));
        assert_eq!(normalize_finish_reason(&json!(2)).as_deref(), Some("max_tokens"));
        assert_eq!(normalize_finish_reason(&json!(99)).as_deref(), Some("99"));
    }

    #[test]
    fn normalize_null_and_empty() {
        assert_eq!(normalize_finish_reason(&json!(null)), None);
        assert_eq!(normalize_finish_reason(&json!("")), None);
    }

    #[test]
    fn classify_by_variant() {
        assert_eq!(
            classify_stream_error(&Error::QuotaExceeded("daily cap".into())),
            StreamFailure::QuotaExceeded
        );
        assert_eq!(
            classify_stream_error(&Error::ServiceUnavailable("down".into())),
            StreamFailure::ServiceUnavailable
        );
    }

    #[test]
    fn classify_by_message() {
        assert_eq!(
            classify_stream_error(&Error::Http("429 resource exhausted".into())),
            StreamFailure::QuotaExceeded
        );
        assert_eq!(
            classify_stream_error(&Error::Http("503 service unavailable".into())),
            StreamFailure::ServiceUnavailable
        );
        assert_eq!(
            classify_stream_error(&Error::Other("boom".into())),
            StreamFailure::Internal
        );
    }
}
