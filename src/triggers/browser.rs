//! Browser event trigger watcher.
//!
//! One task per workflow subscribes to the page event stream and tests each
//! enabled browser-event trigger against incoming navigations, tab updates,
//! and activations. Debounce stamps and run-once latches live inside the
//! task, so rebuilding the watcher resets them.

use crate::page::protocol::{PageEvent, TabQuery};
use crate::page::PageController;
use crate::triggers::TriggerFire;
use crate::workflow::runner::StartContext;
use crate::workflow::schema::{now_ms, BrowserEventConfig, Trigger, TriggerConfig, UrlMatchType};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Watcher loop for all browser-event triggers of one workflow.
pub(crate) async fn watch(
    workflow_id: String,
    triggers: Vec<Trigger>,
    page: Arc<dyn PageController>,
    fire: Arc<TriggerFire>,
) {
    let mut events = page.subscribe_events();
    let mut last_fired: HashMap<String, u64> = HashMap::new();
    let mut fired_once: HashSet<String> = HashSet::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(workflow = %workflow_id, skipped, "browser watcher lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        let Some(url) = event.url.clone() else {
            continue;
        };
        let now = now_ms();

        for trigger in &triggers {
            let TriggerConfig::BrowserEvent(cfg) = &trigger.config else {
                continue;
            };
            if cfg.event != event.event || !matches_url(cfg, &url) {
                continue;
            }

            if cfg.only_if_tab_active && !tab_is_active(&event, page.as_ref()).await {
                continue;
            }

            let last = last_fired.get(&trigger.id).copied().unwrap_or(0);
            if cfg.debounce_ms > 0 && now.saturating_sub(last) < cfg.debounce_ms {
                continue;
            }
            if cfg.run_once_per_session && fired_once.contains(&trigger.id) {
                continue;
            }

            last_fired.insert(trigger.id.clone(), now);
            if cfg.run_once_per_session {
                fired_once.insert(trigger.id.clone());
            }

            fire.fire(
                &workflow_id,
                trigger,
                StartContext {
                    tab_id: event.tab_id,
                    url: Some(url.clone()),
                },
            );
        }
    }
}

/// Use the event's own active flag when present, otherwise ask the browser.
async fn tab_is_active(event: &PageEvent, page: &dyn PageController) -> bool {
    if let Some(active) = event.active {
        return active;
    }
    let Some(tab_id) = event.tab_id else {
        return false;
    };
    match page.query_tabs(TabQuery::Active).await {
        Ok(tabs) => tabs.iter().any(|t| t.id == tab_id && t.active),
        Err(_) => false,
    }
}

fn matches_url(cfg: &BrowserEventConfig, url: &str) -> bool {
    let value = cfg.url_value.trim();
    if value.is_empty() {
        return false;
    }
    match cfg.url_match {
        UrlMatchType::Contains => url.contains(value),
        UrlMatchType::Regex => match regex::Regex::new(value) {
            Ok(re) => re.is_match(url),
            Err(_) => false,
        },
        UrlMatchType::HostEquals => {
            let Some(host) = host_of(url) else {
                return false;
            };
            // The configured value may itself be a URL; compare hosts.
            let target = host_of(value).unwrap_or_else(|| value.to_ascii_lowercase());
            host == target
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("wss://"))
        .or_else(|| url.strip_prefix("ws://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority
        .rsplit('@')
        .next()
        .unwrap_or(authority)
        .split(':')
        .next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::BrowserEventKind;

    fn cfg(url_match: UrlMatchType, value: &str) -> BrowserEventConfig {
        BrowserEventConfig {
            event: BrowserEventKind::NavigationCompleted,
            url_match,
            url_value: value.to_string(),
            debounce_ms: 0,
            only_if_tab_active: false,
            run_once_per_session: false,
        }
    }

    #[test]
    fn test_host_equals() {
        let c = cfg(UrlMatchType::HostEquals, "a.test");
        assert!(matches_url(&c, "https://a.test/path"));
        assert!(!matches_url(&c, "https://b.test/path"));

        let with_url = cfg(UrlMatchType::HostEquals, "https://A.Test/login");
        assert!(matches_url(&with_url, "https://a.test/anything"));
    }

    #[test]
    fn test_contains() {
        let c = cfg(UrlMatchType::Contains, "/checkout");
        assert!(matches_url(&c, "https://a.test/checkout/step1"));
        assert!(!matches_url(&c, "https://a.test/cart"));

        let empty = cfg(UrlMatchType::Contains, "  ");
        assert!(!matches_url(&empty, "https://a.test/"));
    }

    #[test]
    fn test_regex() {
        let c = cfg(UrlMatchType::Regex, r"^https://a\.test/orders/\d+$");
        assert!(matches_url(&c, "https://a.test/orders/42"));
        assert!(!matches_url(&c, "https://a.test/orders/"));

        let bad = cfg(UrlMatchType::Regex, "[unclosed");
        assert!(!matches_url(&bad, "https://a.test/"));
    }
}
