//! Trigger engine: watchers that decide when a workflow run starts.

pub mod browser;
pub mod dom;
pub mod engine;
pub mod policy;
pub mod schedule;
pub mod webhook;

pub use engine::TriggerEngine;
pub use policy::TriggerPolicyGate;

use crate::error::{Result, TabflowError};
use crate::workflow::runner::{StartContext, WorkflowRunner};
use crate::workflow::schema::{
    DomConditionKind, RunTrigger, ScheduleMode, Trigger, TriggerConfig,
};
use std::sync::Arc;

/// Maps a trigger kind to the run source it records.
pub fn run_source(config: &TriggerConfig) -> RunTrigger {
    match config {
        TriggerConfig::Schedule(_) => RunTrigger::Schedule,
        TriggerConfig::BrowserEvent(_) => RunTrigger::Browser,
        TriggerConfig::DomCondition(_) => RunTrigger::Dom,
        TriggerConfig::WebhookWs(_) => RunTrigger::Websocket,
    }
}

/// Shared firing path for every watcher: consult the policy gate, then
/// spawn the run.
pub struct TriggerFire {
    gate: Arc<TriggerPolicyGate>,
    runner: Arc<WorkflowRunner>,
}

impl TriggerFire {
    pub fn new(gate: Arc<TriggerPolicyGate>, runner: Arc<WorkflowRunner>) -> Self {
        Self { gate, runner }
    }

    /// Fire a trigger. Admission and the run itself are logged, rejections
    /// are silent no-ops apart from a debug line.
    pub fn fire(&self, workflow_id: &str, trigger: &Trigger, start: StartContext) {
        if !self.gate.admit(workflow_id, trigger) {
            tracing::debug!(
                workflow = workflow_id,
                trigger = %trigger.id,
                "trigger rejected by run policy"
            );
            return;
        }

        tracing::info!(
            workflow = workflow_id,
            trigger = %trigger.id,
            kind = trigger.config.kind(),
            "trigger fired"
        );

        let runner = self.runner.clone();
        let workflow_id = workflow_id.to_string();
        let source = run_source(&trigger.config);
        tokio::spawn(async move {
            runner.run(&workflow_id, source, start).await;
        });
    }
}

/// Validate a trigger config before it is saved.
pub fn validate_trigger(trigger: &Trigger) -> Result<()> {
    let invalid = |msg: &str| Err(TabflowError::Validation(msg.to_string()));
    match &trigger.config {
        TriggerConfig::Schedule(cfg) => match cfg.mode {
            ScheduleMode::EveryMinutes => {
                if cfg.every_minutes.unwrap_or(0) < 1 {
                    return invalid("Schedule interval must be at least 1 minute");
                }
                Ok(())
            }
            ScheduleMode::EveryMs => {
                if cfg.every_ms.unwrap_or(0) < 10 {
                    return invalid("Schedule interval must be at least 10ms");
                }
                Ok(())
            }
            ScheduleMode::DailyAt => {
                let time = cfg.daily_time.as_deref().unwrap_or("");
                if schedule::parse_daily_time(time).is_none() {
                    return invalid("Daily time must be HH:MM");
                }
                Ok(())
            }
            ScheduleMode::CronLike => {
                let expr = cfg.cron_expression.as_deref().unwrap_or("");
                schedule::CronExpression::parse(expr)
                    .map(|_| ())
                    .map_err(TabflowError::Validation)
            }
        },
        TriggerConfig::BrowserEvent(cfg) => {
            if cfg.url_value.trim().is_empty() {
                return invalid("URL value is required for browser event triggers");
            }
            if cfg.url_match == crate::workflow::schema::UrlMatchType::Regex
                && regex::Regex::new(&cfg.url_value).is_err()
            {
                return invalid("URL pattern is not a valid regex");
            }
            Ok(())
        }
        TriggerConfig::DomCondition(cfg) => {
            if cfg.selector.trim().is_empty() {
                return invalid("Selector is required for DOM condition triggers");
            }
            match cfg.condition {
                DomConditionKind::TextContains if cfg.text.as_deref().unwrap_or("").is_empty() => {
                    invalid("Text is required for a text-contains condition")
                }
                DomConditionKind::AttributeEquals
                    if cfg.attribute_name.as_deref().unwrap_or("").is_empty() =>
                {
                    invalid("Attribute name is required for an attribute-equals condition")
                }
                _ => Ok(()),
            }
        }
        TriggerConfig::WebhookWs(cfg) => {
            if cfg.event_name.trim().is_empty() {
                return invalid("Event name is required for WebSocket triggers");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::{
        BrowserEventConfig, BrowserEventKind, ScheduleTriggerConfig, ScheduleTimezone,
        UrlMatchType, WebhookWsConfig,
    };

    fn trigger(config: TriggerConfig) -> Trigger {
        Trigger {
            id: "t1".to_string(),
            name: "t".to_string(),
            enabled: true,
            config,
            last_event: None,
        }
    }

    #[test]
    fn test_validate_schedule() {
        let bad = trigger(TriggerConfig::Schedule(ScheduleTriggerConfig {
            mode: ScheduleMode::EveryMinutes,
            every_minutes: Some(0),
            every_ms: None,
            daily_time: None,
            cron_expression: None,
            timezone: ScheduleTimezone::Local,
            jitter_ms: 0,
        }));
        assert!(validate_trigger(&bad).is_err());

        let good = trigger(TriggerConfig::Schedule(ScheduleTriggerConfig {
            mode: ScheduleMode::DailyAt,
            every_minutes: None,
            every_ms: None,
            daily_time: Some("09:30".to_string()),
            cron_expression: None,
            timezone: ScheduleTimezone::Utc,
            jitter_ms: 0,
        }));
        assert!(validate_trigger(&good).is_ok());
    }

    #[test]
    fn test_validate_browser_event_regex() {
        let bad = trigger(TriggerConfig::BrowserEvent(BrowserEventConfig {
            event: BrowserEventKind::NavigationCompleted,
            url_match: UrlMatchType::Regex,
            url_value: "[unclosed".to_string(),
            debounce_ms: 300,
            only_if_tab_active: false,
            run_once_per_session: false,
        }));
        assert!(validate_trigger(&bad).is_err());
    }

    #[test]
    fn test_validate_webhook() {
        let bad = trigger(TriggerConfig::WebhookWs(WebhookWsConfig {
            event_name: " ".to_string(),
            channel: None,
            auth_token: None,
            dedupe_window_ms: 0,
        }));
        assert!(validate_trigger(&bad).is_err());
    }
}
