//! Wire protocol between the engine and the page side.
//!
//! One request/response pair per atomic action, uniformly shaped
//! `{ok, error?, ...kind-specific fields}`. Push messages carry browser
//! events (navigation, tab updates/activation) back to the engine.

use crate::workflow::schema::{
    BrowserEventKind, Condition, EvaluateConfig, ExtractConfig, ScreenshotConfig, ScrollConfig,
    WaitConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A command executed against a page or the browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PageCommand {
    QueryTabs {
        query: TabQuery,
    },
    Navigate {
        url: String,
    },
    Click {
        selector: String,
        click_mode: crate::workflow::schema::ClickMode,
        timeout_ms: u64,
    },
    TypeText {
        selector: String,
        value: String,
    },
    Select {
        selector: String,
        value: String,
        timeout_ms: u64,
    },
    Wait {
        wait: WaitConfig,
        timeout_ms: u64,
    },
    Scroll {
        scroll: ScrollConfig,
        timeout_ms: u64,
    },
    Extract {
        extract: ExtractConfig,
        timeout_ms: u64,
    },
    Screenshot {
        screenshot: ScreenshotConfig,
        file_name: String,
    },
    Evaluate {
        evaluate: EvaluateConfig,
        args: Vec<ResolvedArg>,
        vars: HashMap<String, String>,
    },
    CheckCondition {
        condition: Condition,
    },
    RunFallback {
        code: String,
    },
    GetCookies {
        all: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        domain: Option<String>,
        names: Vec<String>,
    },
    GetPageSource,
    Download {
        data_url: String,
        file_name: String,
    },
}

/// Evaluate argument with its coerced value attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedArg {
    pub name: String,
    pub value: serde_json::Value,
}

/// Tab selection for `QueryTabs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "select", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TabQuery {
    Active,
    All,
    ByScopeRegex { regex: String },
}

/// Kind-specific successful reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PageReply {
    Ack,
    Tabs {
        tabs: Vec<TabInfo>,
    },
    Extracted {
        value: serde_json::Value,
        values: Vec<serde_json::Value>,
        raw_values: Vec<String>,
        #[serde(default)]
        used_default: bool,
    },
    Screenshot {
        data_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base64: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
    },
    Evaluated {
        result: serde_json::Value,
    },
    Condition {
        result: bool,
    },
    Cookies {
        cookies: Vec<Cookie>,
    },
    PageSource {
        html: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
}

/// A browser event pushed from the page side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEvent {
    pub event: BrowserEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Whether the tab was active, when the sender knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tagging() {
        let cmd = PageCommand::Click {
            selector: "#btn".to_string(),
            click_mode: crate::workflow::schema::ClickMode::Single,
            timeout_ms: 5000,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "click");
        assert_eq!(json["clickMode"], "single");
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = PageReply::Extracted {
            value: serde_json::json!("42"),
            values: vec![serde_json::json!("42")],
            raw_values: vec!["42".to_string()],
            used_default: false,
        };
        let json = serde_json::to_string(&reply).unwrap();
        let parsed: PageReply = serde_json::from_str(&json).unwrap();
        match parsed {
            PageReply::Extracted { value, .. } => assert_eq!(value, serde_json::json!("42")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
