use deskmirror_core::{FieldError, RemoteError};
use serde_json::Value;

/// Map a non-success HTTP response onto the remote error taxonomy.
///
/// `body` is the raw response text; helpdesk error bodies look like
/// `{"description": "...", "errors": [{"field", "message", "code"}]}`.
pub fn classify(status: u16, retry_after: Option<&str>, body: &str) -> RemoteError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(error_message)
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("status {status}")
            } else {
                trimmed.to_string()
            }
        });

    match status {
        401 => RemoteError::Authentication(message),
        403 => RemoteError::PermissionDenied(message),
        404 => RemoteError::NotFound(message),
        400 | 409 | 422 => RemoteError::Validation {
            errors: parsed.as_ref().map(field_errors).unwrap_or_default(),
            message,
        },
        429 => RemoteError::RateLimited {
            retry_after_secs: retry_after.and_then(|v| v.trim().parse::<u64>().ok()),
        },
        500..=599 => RemoteError::ServiceUnavailable { status },
        _ => RemoteError::Request(format!("unexpected status {status}: {message}")),
    }
}

pub fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Request(e.to_string())
}

fn error_message(body: &Value) -> Option<String> {
    ["description", "message", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn field_errors(body: &Value) -> Vec<FieldError> {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<FieldError>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_lookup_failures() {
        assert!(matches!(
            classify(401, None, ""),
            RemoteError::Authentication(m) if m == "status 401"
        ));
        assert!(matches!(classify(403, None, "nope"), RemoteError::PermissionDenied(_)));
        assert!(matches!(
            classify(404, None, r#"{"message": "no such ticket"}"#),
            RemoteError::NotFound(m) if m == "no such ticket"
        ));
    }

    #[test]
    fn validation_carries_field_errors() {
        let body = r#"{
            "description": "Validation failed",
            "errors": [{"field": "email", "message": "It should be a valid email", "code": "invalid_value"}]
        }"#;
        for status in [400, 409, 422] {
            let err = classify(status, None, body);
            let RemoteError::Validation { message, errors } = &err else {
                panic!("expected validation error for {status}, got {err:?}");
            };
            assert_eq!(message, "Validation failed");
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].field, "email");
            assert_eq!(errors[0].code.as_deref(), Some("invalid_value"));
        }
    }

    #[test]
    fn throttling_and_outages_are_retryable() {
        let limited = classify(429, Some("30"), "");
        assert_eq!(
            limited,
            RemoteError::RateLimited {
                retry_after_secs: Some(30)
            }
        );
        assert!(limited.is_retryable());

        let down = classify(503, None, "<html>");
        assert_eq!(down, RemoteError::ServiceUnavailable { status: 503 });
        assert!(down.is_retryable());

        assert!(matches!(classify(418, None, ""), RemoteError::Request(_)));
    }
}
