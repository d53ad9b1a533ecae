//! DOM condition trigger watcher.
//!
//! Each trigger polls its own loop: resolve a target tab, ask the page to
//! wait for the condition, fire on success. `once` stops after the first
//! firing, `everyTime` re-arms after the cooldown. Timeouts and errors back
//! off and retry, independently per trigger.

use crate::page::protocol::{PageCommand, TabQuery};
use crate::page::PageController;
use crate::triggers::TriggerFire;
use crate::workflow::runner::StartContext;
use crate::workflow::schema::{
    DomConditionConfig, DomConditionKind, FireMode, TargetTabScope, Trigger, WaitConfig, WaitFor,
    WaitStrategy,
};
use std::sync::Arc;
use std::time::Duration;

/// Pause before retrying when no target tab exists yet.
const NO_TAB_RETRY: Duration = Duration::from_millis(1500);

/// Watcher loop for one DOM condition trigger.
pub(crate) async fn watch(
    workflow_id: String,
    trigger: Trigger,
    cfg: DomConditionConfig,
    page: Arc<dyn PageController>,
    fire: Arc<TriggerFire>,
) {
    loop {
        let Some(tab_id) = resolve_tab(&cfg, page.as_ref()).await else {
            tokio::time::sleep(NO_TAB_RETRY).await;
            continue;
        };

        let wait = build_wait_config(&cfg);
        let result = page
            .execute(
                Some(tab_id),
                PageCommand::Wait {
                    wait,
                    timeout_ms: cfg.timeout_ms.max(1),
                },
            )
            .await;

        match result {
            Ok(_) => {
                fire.fire(
                    &workflow_id,
                    &trigger,
                    StartContext {
                        tab_id: Some(tab_id),
                        url: None,
                    },
                );
                match cfg.fire_mode {
                    FireMode::Once => return,
                    FireMode::EveryTime => {
                        tokio::time::sleep(Duration::from_millis(cfg.cooldown_ms)).await;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(
                    workflow = %workflow_id,
                    trigger = %trigger.id,
                    "dom condition wait failed: {e}"
                );
                let retry = cfg.cooldown_ms.max(500);
                tokio::time::sleep(Duration::from_millis(retry)).await;
            }
        }
    }
}

async fn resolve_tab(cfg: &DomConditionConfig, page: &dyn PageController) -> Option<i64> {
    let query = match cfg.target_tab {
        TargetTabScope::AnyTabMatchingScope => {
            let regex = cfg.scope_url_regex.clone().unwrap_or_default();
            if regex.trim().is_empty() {
                return None;
            }
            TabQuery::ByScopeRegex { regex }
        }
        TargetTabScope::CurrentTab => TabQuery::Active,
    };
    page.find_tab(query).await.ok().flatten().map(|t| t.id)
}

fn build_wait_config(cfg: &DomConditionConfig) -> WaitConfig {
    let wait_for = match cfg.condition {
        DomConditionKind::SelectorAppears => WaitFor::SelectorAppears,
        DomConditionKind::SelectorDisappears => WaitFor::SelectorDisappears,
        DomConditionKind::TextContains => WaitFor::TextContains,
        DomConditionKind::AttributeEquals => WaitFor::AttributeEquals,
        DomConditionKind::ElementEnabled => WaitFor::ElementEnabled,
    };
    WaitConfig {
        wait_for,
        selector: Some(cfg.selector.clone()),
        text: cfg.text.clone(),
        attribute_name: cfg.attribute_name.clone(),
        attribute_value: cfg.attribute_value.clone(),
        url_regex: None,
        time_ms: None,
        interval_ms: 250,
        strategy: WaitStrategy::Observer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_wait_config_maps_condition() {
        let cfg = DomConditionConfig {
            condition: DomConditionKind::TextContains,
            selector: "#status".to_string(),
            text: Some("ready".to_string()),
            attribute_name: None,
            attribute_value: None,
            timeout_ms: 10_000,
            cooldown_ms: 1000,
            fire_mode: FireMode::Once,
            target_tab: TargetTabScope::CurrentTab,
            scope_url_regex: None,
        };
        let wait = build_wait_config(&cfg);
        assert_eq!(wait.wait_for, WaitFor::TextContains);
        assert_eq!(wait.selector.as_deref(), Some("#status"));
        assert_eq!(wait.text.as_deref(), Some("ready"));
    }
}
