//! Request-body validation with the exact messages the REST surface
//! documents. Bodies arrive as loose JSON; unknown fields are ignored.

use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// All named fields must be present (not absent, not `null`).
pub fn require_fields(body: &Value, fields: &[&str]) -> Result<()> {
    let missing: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| body.get(f).is_none_or(Value::is_null))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )))
    }
}

/// All named fields must be JSON strings.
pub fn require_strings(body: &Value, fields: &[&str]) -> Result<()> {
    let wrong: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| !body.get(f).is_some_and(Value::is_string))
        .collect();

    if wrong.is_empty() {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "{} must be string(s)",
            wrong.join(", ")
        )))
    }
}

/// String fields must carry more than whitespace.
pub fn require_non_empty(body: &Value, fields: &[&str]) -> Result<()> {
    let empty: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| {
            body.get(f)
                .and_then(Value::as_str)
                .is_some_and(|s| s.trim().is_empty())
        })
        .collect();

    if empty.is_empty() {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "{} cannot be empty or contain only whitespace",
            empty.join(", ")
        )))
    }
}

/// Parse an ISO-8601 datetime field.
pub fn parse_datetime(body: &Value, field: &str) -> Result<DateTime<Utc>> {
    let raw = body
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest(format!("{field} must be string(s)")))?;

    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            AppError::BadRequest(format!("{field} must be a valid ISO-8601 datetime"))
        })
}

/// Convenience for the common required-string-field pipeline.
pub fn required_string<'a>(body: &'a Value, field: &str) -> Result<&'a str> {
    require_fields(body, &[field])?;
    require_strings(body, &[field])?;
    require_non_empty(body, &[field])?;
    Ok(body.get(field).and_then(Value::as_str).expect("validated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(err: AppError) -> String {
        match err {
            AppError::BadRequest(msg) => msg,
            other => panic!("expected BadRequest, got {other:?}"),
        }
    }

    #[test]
    fn missing_fields_are_listed() {
        let body = json!({"email": "a@example.com"});
        let err = require_fields(&body, &["full_name", "email", "title"]).unwrap_err();
        assert_eq!(message(err), "Missing required fields: full_name, title");
    }

    #[test]
    fn null_counts_as_missing() {
        let body = json!({"email": null});
        let err = require_fields(&body, &["email"]).unwrap_err();
        assert_eq!(message(err), "Missing required fields: email");
    }

    #[test]
    fn non_string_fields_are_rejected() {
        let body = json!({"full_name": 42, "email": "a@example.com"});
        let err = require_strings(&body, &["full_name", "email"]).unwrap_err();
        assert_eq!(message(err), "full_name must be string(s)");
    }

    #[test]
    fn whitespace_only_is_rejected() {
        let body = json!({"full_name": "   "});
        let err = require_non_empty(&body, &["full_name"]).unwrap_err();
        assert_eq!(
            message(err),
            "full_name cannot be empty or contain only whitespace"
        );
    }

    #[test]
    fn datetime_accepts_rfc3339() {
        let body = json!({"scheduled_at": "2026-08-01T10:30:00Z"});
        let parsed = parse_datetime(&body, "scheduled_at").unwrap();
        assert_eq!(parsed.timestamp(), 1785580200);
    }

    #[test]
    fn datetime_rejects_garbage() {
        let body = json!({"scheduled_at": "next tuesday"});
        let err = parse_datetime(&body, "scheduled_at").unwrap_err();
        assert_eq!(
            message(err),
            "scheduled_at must be a valid ISO-8601 datetime"
        );
    }

    #[test]
    fn extra_fields_do_not_fail_validation() {
        let body = json!({"full_name": "Ada", "unexpected": {"nested": true}});
        assert!(required_string(&body, "full_name").is_ok());
    }
}
