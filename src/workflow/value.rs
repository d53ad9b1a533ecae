//! Value resolution for step inputs.
//!
//! `type`/`select` steps take their value either from a fixed string or from
//! the response of an HTTP request, optionally retried while a JSON-field or
//! status-code condition holds.

use crate::workflow::schema::{
    CompareOperator, Header, RequestSourceConfig, RetryCondition, RetryConfig, ValueSource,
};
use crate::workflow::template::{apply_template, TemplateContext};
use std::time::Duration;

/// Delay between conditional-retry attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Outcome of one resolved HTTP request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub status: u16,
    pub text: String,
    pub json: Option<serde_json::Value>,
    /// Value found at `response_json_path`, when configured and present.
    pub extracted: Option<serde_json::Value>,
}

impl RequestOutcome {
    /// Best textual form of the response for variable storage.
    pub fn value_string(&self) -> String {
        let value = self
            .extracted
            .clone()
            .or_else(|| self.json.clone())
            .unwrap_or(serde_json::Value::Null);
        json_to_string(&value, &self.text)
    }
}

fn json_to_string(value: &serde_json::Value, fallback_text: &str) -> String {
    match value {
        serde_json::Value::Null => fallback_text.to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve a step value from its source.
pub async fn resolve_value(
    client: &reqwest::Client,
    source: &ValueSource,
    ctx: &TemplateContext,
) -> Result<String, String> {
    match source {
        ValueSource::Fixed { value } => Ok(apply_template(value, ctx)),
        ValueSource::Request { request } => {
            let outcome = execute_request_with_retry(client, request, ctx).await?;
            if outcome.status >= 400 {
                return Err(format!("Value request failed with status {}", outcome.status));
            }
            Ok(outcome.value_string())
        }
    }
}

/// Issue the configured request, retrying while the retry condition holds.
pub async fn execute_request_with_retry(
    client: &reqwest::Client,
    config: &RequestSourceConfig,
    ctx: &TemplateContext,
) -> Result<RequestOutcome, String> {
    let url = apply_template(&config.url, ctx).trim().to_string();
    if url.is_empty() {
        return Err("Request URL is required".to_string());
    }

    let headers = resolve_headers(&config.headers, ctx);
    let content_type = apply_template(&config.content_type, ctx);
    let body = apply_template(&config.body, ctx);
    let json_path = apply_template(&config.response_json_path, ctx);

    let max_attempts = if config.retry.enabled {
        config.retry.max_retries.saturating_add(1)
    } else {
        1
    };

    let mut outcome = issue_request(client, &config.method, &url, &headers, &content_type, &body, &json_path).await?;

    let mut attempt = 1;
    while attempt < max_attempts && should_retry(&config.retry, &outcome) {
        tracing::debug!(url = %url, attempt, status = outcome.status, "retrying value request");
        tokio::time::sleep(RETRY_DELAY).await;
        outcome = issue_request(client, &config.method, &url, &headers, &content_type, &body, &json_path).await?;
        attempt += 1;
    }

    Ok(outcome)
}

fn resolve_headers(headers: &[Header], ctx: &TemplateContext) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|h| {
            let key = apply_template(&h.key, ctx).trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some((key, apply_template(&h.value, ctx)))
            }
        })
        .collect()
}

async fn issue_request(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: &[(String, String)],
    content_type: &str,
    body: &str,
    json_path: &str,
) -> Result<RequestOutcome, String> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("Invalid HTTP method: {method}"))?;
    let has_body = !body.is_empty() && method != reqwest::Method::GET;

    let mut req = client.request(method, url);
    if !content_type.is_empty() && content_type != "none" {
        req = req.header(reqwest::header::CONTENT_TYPE, content_type);
    }
    for (key, value) in headers {
        req = req.header(key, value);
    }
    if has_body {
        req = req.body(body.to_string());
    }

    let resp = req.send().await.map_err(|e| format!("Request failed: {e}"))?;
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let json: Option<serde_json::Value> = serde_json::from_str(&text).ok();
    let extracted = if json_path.is_empty() {
        None
    } else {
        json.as_ref().and_then(|j| walk_json_path(j, json_path)).cloned()
    };

    Ok(RequestOutcome {
        status,
        text,
        json,
        extracted,
    })
}

fn should_retry(retry: &RetryConfig, outcome: &RequestOutcome) -> bool {
    if !retry.enabled {
        return false;
    }
    match &retry.condition {
        Some(RetryCondition::StatusCode { expected }) => outcome.status != *expected,
        Some(RetryCondition::JsonField { field, operator, value }) => {
            let field_value = outcome
                .json
                .as_ref()
                .and_then(|j| walk_json_path(j, field))
                .map(|v| json_to_string(v, ""))
                .unwrap_or_default();
            match operator {
                CompareOperator::Equals => field_value == *value,
                CompareOperator::NotEquals => field_value != *value,
                CompareOperator::Contains => field_value.contains(value.as_str()),
                CompareOperator::NotContains => !field_value.contains(value.as_str()),
            }
        }
        None => false,
    }
}

/// Walk a dot/bracket path ("data.items[0].name") into a JSON value.
pub fn walk_json_path<'a>(
    value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, indexes) = parse_segment(segment)?;
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for idx in indexes {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(pos) => {
            let key = &segment[..pos];
            let mut indexes = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let end = stripped.find(']')?;
                indexes.push(stripped[..end].parse().ok()?);
                rest = &stripped[end + 1..];
            }
            if rest.is_empty() {
                Some((key, indexes))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_walk_json_path() {
        let value = json!({"data": {"items": [{"name": "first"}, {"name": "second"}]}});
        assert_eq!(
            walk_json_path(&value, "data.items[1].name").unwrap(),
            &json!("second")
        );
        assert_eq!(walk_json_path(&value, "data.items[0]").unwrap()["name"], "first");
        assert!(walk_json_path(&value, "data.missing").is_none());
        assert!(walk_json_path(&value, "data.items[9]").is_none());
    }

    #[test]
    fn test_walk_json_path_root() {
        let value = json!({"ok": true});
        assert_eq!(walk_json_path(&value, "").unwrap(), &value);
        assert_eq!(walk_json_path(&value, "ok").unwrap(), &json!(true));
    }

    #[test]
    fn test_should_retry_status_code() {
        let retry = RetryConfig {
            enabled: true,
            max_retries: 3,
            condition: Some(RetryCondition::StatusCode { expected: 200 }),
        };
        let pending = RequestOutcome {
            status: 202,
            text: String::new(),
            json: None,
            extracted: None,
        };
        let done = RequestOutcome { status: 200, ..pending.clone() };
        assert!(should_retry(&retry, &pending));
        assert!(!should_retry(&retry, &done));
    }

    #[test]
    fn test_should_retry_json_field() {
        let retry = RetryConfig {
            enabled: true,
            max_retries: 3,
            condition: Some(RetryCondition::JsonField {
                field: "status".to_string(),
                operator: CompareOperator::NotEquals,
                value: "done".to_string(),
            }),
        };
        let running = RequestOutcome {
            status: 200,
            text: String::new(),
            json: Some(json!({"status": "running"})),
            extracted: None,
        };
        let done = RequestOutcome {
            json: Some(json!({"status": "done"})),
            ..running.clone()
        };
        assert!(should_retry(&retry, &running));
        assert!(!should_retry(&retry, &done));
    }

    #[test]
    fn test_disabled_retry_never_retries() {
        let outcome = RequestOutcome {
            status: 500,
            text: String::new(),
            json: None,
            extracted: None,
        };
        assert!(!should_retry(&RetryConfig::default(), &outcome));
    }

    #[test]
    fn test_outcome_value_string_prefers_extracted() {
        let outcome = RequestOutcome {
            status: 200,
            text: "{\"token\":\"abc\"}".to_string(),
            json: Some(json!({"token": "abc"})),
            extracted: Some(json!("abc")),
        };
        assert_eq!(outcome.value_string(), "abc");
    }
}
