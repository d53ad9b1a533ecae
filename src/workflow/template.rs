//! Placeholder templating for step configs.
//!
//! Step strings (URLs, headers, bodies, file names, code) may reference the
//! run context with `{{...}}` placeholders: `{{vars.name}}` reads a workflow
//! variable, the rest read run metadata (`{{workflowId}}`, `{{stepName}}`,
//! `{{url}}`, `{{timestamp}}`, `{{isoTimestamp}}`, `{{date}}`, ...).
//! Unknown placeholders are left in place.

use crate::workflow::schema::now_ms;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

/// Values visible to `{{...}}` placeholders for one step execution.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub vars: HashMap<String, String>,
    pub workflow_id: String,
    pub workflow_name: String,
    pub step_id: Option<String>,
    pub step_name: Option<String>,
    pub url: Option<String>,
    pub timestamp_ms: u64,
    /// Call-site extras (upload payload fields, file names).
    pub extra: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new(workflow_id: &str, workflow_name: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            timestamp_ms: now_ms(),
            ..Self::default()
        }
    }

    pub fn with_extra(&self, key: &str, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.extra.insert(key.to_string(), value.into());
        next
    }

    fn iso_timestamp(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms as i64)
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if let Some(var) = key.strip_prefix("vars.") {
            return self.vars.get(var).cloned();
        }
        if let Some(value) = self.extra.get(key) {
            return Some(value.clone());
        }
        match key {
            "workflowId" => Some(self.workflow_id.clone()),
            "workflowName" | "workflow" => Some(self.workflow_name.clone()),
            "stepId" => self.step_id.clone(),
            "stepName" => self.step_name.clone(),
            "step" => self.step_name.clone().or_else(|| self.step_id.clone()),
            "url" => self.url.clone(),
            "timestamp" => Some((self.timestamp_ms / 1000).to_string()),
            "timestampMs" => Some(self.timestamp_ms.to_string()),
            "isoTimestamp" => Some(self.iso_timestamp()),
            "date" => Some(self.iso_timestamp()[..10].to_string()),
            _ => None,
        }
    }
}

/// Replace every `{{key}}` placeholder in `input` with its context value.
pub fn apply_template(input: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match ctx.lookup(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Strip an optional `vars.` prefix from a user-entered variable name.
pub fn normalize_var_name(key: &str) -> String {
    let trimmed = key.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if let Some(rest) = lowered.strip_prefix("vars.") {
        trimmed[trimmed.len() - rest.len()..].to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        let mut ctx = TemplateContext::new("wf-1", "Checkout");
        ctx.vars.insert("token".to_string(), "abc123".to_string());
        ctx.step_name = Some("Login".to_string());
        ctx.url = Some("https://a.test/cart".to_string());
        ctx.timestamp_ms = 1_700_000_000_000;
        ctx
    }

    #[test]
    fn test_vars_and_metadata_placeholders() {
        let out = apply_template("{{workflow}}/{{stepName}}?t={{vars.token}}", &ctx());
        assert_eq!(out, "Checkout/Login?t=abc123");
    }

    #[test]
    fn test_timestamp_placeholders() {
        let out = apply_template("{{timestamp}}|{{timestampMs}}|{{date}}", &ctx());
        assert_eq!(out, "1700000000|1700000000000|2023-11-14");
    }

    #[test]
    fn test_unknown_placeholder_left_in_place() {
        let out = apply_template("x={{nope}}", &ctx());
        assert_eq!(out, "x={{nope}}");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let out = apply_template("broken {{tail", &ctx());
        assert_eq!(out, "broken {{tail");
    }

    #[test]
    fn test_extra_values_win() {
        let out = apply_template("{{fileName}}", &ctx().with_extra("fileName", "shot.png"));
        assert_eq!(out, "shot.png");
    }

    #[test]
    fn test_normalize_var_name() {
        assert_eq!(normalize_var_name(" vars.result "), "result");
        assert_eq!(normalize_var_name("Vars.Result"), "Result");
        assert_eq!(normalize_var_name("result"), "result");
    }
}
