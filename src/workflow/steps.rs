//! Step execution: dispatches one atomic step to the page controller or the
//! HTTP client and reports a uniform outcome.

use crate::page::protocol::{PageCommand, PageEvent, PageReply, ResolvedArg, TabQuery};
use crate::page::{PageController, PageError};
use crate::workflow::allowed::is_url_allowed;
use crate::workflow::manager::WorkflowManager;
use crate::workflow::schema::{
    ArgType, AtomicStep, CaptureMode, EvaluateArg, EvaluateConfig, EvaluateTarget, ExpectedType,
    ImageFormat, RequestSourceConfig, RetryConfig, RunArtifact, ArtifactKind, ScreenshotConfig,
    ScreenshotOnFail, ScreenshotSink, ScrollType, StepAction, Workflow, now_ms,
};
use crate::workflow::template::{apply_template, normalize_var_name, TemplateContext};
use crate::workflow::value::{execute_request_with_retry, resolve_value, walk_json_path};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on goTo navigation waits.
const NAVIGATION_TIMEOUT_MS: u64 = 15_000;

/// Tab poll cadence while waiting for a navigation to land.
const NAVIGATION_POLL: Duration = Duration::from_millis(350);

/// Mutable per-run state shared between the runner and the executor.
#[derive(Debug, Default)]
pub struct RunState {
    pub run_id: String,
    pub vars: HashMap<String, String>,
    pub tab_id: Option<i64>,
    pub tab_url: Option<String>,
}

/// Successful step outcome.
#[derive(Debug, PartialEq, Eq)]
pub enum StepSuccess {
    Done,
    /// The step did not complete but policy downgrades it to skipped
    /// (screenshot onFail = continue).
    Skipped { reason: String },
}

pub type StepResult = Result<StepSuccess, String>;

/// Executes single steps against the page controller / HTTP client.
pub struct StepExecutor {
    page: Arc<dyn PageController>,
    http: reqwest::Client,
    manager: Arc<WorkflowManager>,
}

impl StepExecutor {
    pub fn new(page: Arc<dyn PageController>, manager: Arc<WorkflowManager>) -> Self {
        Self {
            page,
            http: reqwest::Client::new(),
            manager,
        }
    }

    pub fn page(&self) -> &Arc<dyn PageController> {
        &self.page
    }

    /// Run one atomic step. The whole action is bounded by the step's
    /// timeout (or the workflow default); elapsing is a failure.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        step: &AtomicStep,
        state: &mut RunState,
    ) -> StepResult {
        let timeout_ms = self.effective_timeout(workflow, step);
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.execute_inner(workflow, step, state),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!("Step timeout after {timeout_ms}ms")),
        }
    }

    fn effective_timeout(&self, workflow: &Workflow, step: &AtomicStep) -> u64 {
        let base = step
            .timeout_ms
            .unwrap_or(workflow.settings.default_timeout_ms);
        // goTo waits are bounded by the navigation watcher below; give the
        // outer guard room so the watcher reports the timeout, not us.
        match step.action {
            StepAction::GoTo { .. } => {
                step.timeout_ms.unwrap_or(NAVIGATION_TIMEOUT_MS).max(1000) + 1000
            }
            _ => base.max(1000),
        }
    }

    async fn execute_inner(
        &self,
        workflow: &Workflow,
        step: &AtomicStep,
        state: &mut RunState,
    ) -> StepResult {
        match &step.action {
            StepAction::GoTo { url } => self.go_to(workflow, step, url, state).await,
            StepAction::Click {
                selector,
                click_mode,
            } => {
                if selector.trim().is_empty() {
                    return Err("Missing selector".to_string());
                }
                let timeout_ms = step.timeout_ms.unwrap_or(5000);
                self.page_step(
                    state.tab_id,
                    PageCommand::Click {
                        selector: selector.clone(),
                        click_mode: *click_mode,
                        timeout_ms,
                    },
                )
                .await?;
                Ok(StepSuccess::Done)
            }
            StepAction::TypeText {
                selector,
                value,
                value_source,
            } => {
                if selector.trim().is_empty() {
                    return Err("Missing selector".to_string());
                }
                let ctx = self.template_ctx(workflow, step, state);
                let resolved = match value_source {
                    Some(source) => resolve_value(&self.http, source, &ctx).await?,
                    None => apply_template(value, &ctx),
                };
                self.page_step(
                    state.tab_id,
                    PageCommand::TypeText {
                        selector: selector.clone(),
                        value: resolved,
                    },
                )
                .await?;
                Ok(StepSuccess::Done)
            }
            StepAction::Select {
                selector,
                value,
                value_source,
            } => {
                if selector.trim().is_empty() {
                    return Err("Missing selector".to_string());
                }
                let ctx = self.template_ctx(workflow, step, state);
                let resolved = match value_source {
                    Some(source) => resolve_value(&self.http, source, &ctx).await?,
                    None => apply_template(value, &ctx),
                };
                self.page_step(
                    state.tab_id,
                    PageCommand::Select {
                        selector: selector.clone(),
                        value: resolved,
                        timeout_ms: step.timeout_ms.unwrap_or(5000),
                    },
                )
                .await?;
                Ok(StepSuccess::Done)
            }
            StepAction::Wait { wait } => {
                let timeout_ms = step
                    .timeout_ms
                    .or(wait.time_ms)
                    .unwrap_or(5000);
                self.page_step(
                    state.tab_id,
                    PageCommand::Wait {
                        wait: wait.clone(),
                        timeout_ms,
                    },
                )
                .await?;
                Ok(StepSuccess::Done)
            }
            StepAction::Scroll { scroll } => {
                let needs_selector = matches!(
                    scroll.scroll_type,
                    ScrollType::ToSelector | ScrollType::IntoView
                );
                if needs_selector && scroll.selector.as_deref().unwrap_or("").trim().is_empty() {
                    return Err("Selector is required for this scroll type".to_string());
                }
                self.page_step(
                    state.tab_id,
                    PageCommand::Scroll {
                        scroll: scroll.clone(),
                        timeout_ms: step.timeout_ms.unwrap_or(5000),
                    },
                )
                .await?;
                Ok(StepSuccess::Done)
            }
            StepAction::Evaluate { evaluate } => self.evaluate(workflow, step, evaluate, state).await,
            StepAction::Extract { extract } => {
                if extract.selector.trim().is_empty() {
                    return Err("Selector is required for extract".to_string());
                }
                let reply = self
                    .page_step(
                        state.tab_id,
                        PageCommand::Extract {
                            extract: extract.clone(),
                            timeout_ms: step.timeout_ms.unwrap_or(5000),
                        },
                    )
                    .await?;
                if let PageReply::Extracted { value, .. } = reply {
                    if let Some(key) = extract.save_as.as_deref() {
                        let key = normalize_var_name(key);
                        if !key.is_empty() {
                            let serialized = match &value {
                                serde_json::Value::String(s) => s.clone(),
                                other => {
                                    serde_json::to_string_pretty(other).unwrap_or_default()
                                }
                            };
                            self.save_var(workflow, state, &key, serialized);
                        }
                    }
                }
                Ok(StepSuccess::Done)
            }
            StepAction::Request { request } => {
                let ctx = self.template_ctx(workflow, step, state);
                // Reuses the value-resolution request path with retry off.
                let source = RequestSourceConfig {
                    url: request.url.clone(),
                    method: request.method.clone(),
                    content_type: request.content_type.clone(),
                    headers: request.headers.clone(),
                    body: request.body.clone(),
                    response_json_path: request.response_json_path.clone(),
                    retry: RetryConfig::default(),
                };
                let outcome = execute_request_with_retry(&self.http, &source, &ctx).await?;
                if outcome.status >= 400 {
                    return Err(format!("Request failed with status {}", outcome.status));
                }
                if let Some(key) = request.save_to.as_deref() {
                    let key = normalize_var_name(key);
                    if !key.is_empty() {
                        self.save_var(workflow, state, &key, outcome.value_string());
                    }
                }
                Ok(StepSuccess::Done)
            }
            StepAction::SendCookies { upload } => {
                let ctx = self.template_ctx(workflow, step, state);
                let url = apply_template(&upload.server_url, &ctx).trim().to_string();
                if url.is_empty() {
                    return Err("Server URL is required".to_string());
                }

                let cookie_domain = upload.cookie_domain.clone().or_else(|| {
                    state
                        .tab_url
                        .as_deref()
                        .and_then(host_of_url)
                });
                let names: Vec<String> = upload
                    .cookie_names
                    .iter()
                    .filter(|n| !n.trim().is_empty())
                    .cloned()
                    .collect();

                let cookies = self
                    .page
                    .get_cookies(state.tab_id, upload.cookie_all, cookie_domain.clone(), names.clone())
                    .await
                    .map_err(|e| e.to_string())?;

                let body = serde_json::json!({
                    "cookieAll": upload.cookie_all,
                    "cookieDomain": cookie_domain,
                    "cookieNames": names,
                    "tabUrl": state.tab_url,
                    "cookies": cookies,
                });
                self.post_json(&upload.method, &url, &upload.headers, &ctx, body, "Cookie send")
                    .await?;
                Ok(StepSuccess::Done)
            }
            StepAction::SendPageSource { upload } => {
                let ctx = self.template_ctx(workflow, step, state);
                let url = apply_template(&upload.server_url, &ctx).trim().to_string();
                if url.is_empty() {
                    return Err("Server URL is required".to_string());
                }

                let html = self
                    .page
                    .get_page_source(state.tab_id)
                    .await
                    .map_err(|e| e.to_string())?;

                let method = if upload.method.eq_ignore_ascii_case("PUT") {
                    "PUT"
                } else {
                    "POST"
                };
                let body = serde_json::json!({
                    "tabUrl": state.tab_url,
                    "html": html,
                    "length": html.len(),
                    "timestamp": now_ms(),
                });
                self.post_json(method, &url, &upload.headers, &ctx, body, "Page source send")
                    .await?;
                Ok(StepSuccess::Done)
            }
            StepAction::Screenshot { screenshot } => {
                self.screenshot(workflow, step, screenshot, state).await
            }
        }
    }

    // ==================== goTo ====================

    async fn go_to(
        &self,
        workflow: &Workflow,
        step: &AtomicStep,
        url: &str,
        state: &mut RunState,
    ) -> StepResult {
        let ctx = self.template_ctx(workflow, step, state);
        let resolved_url = apply_template(url, &ctx).trim().to_string();
        if resolved_url.is_empty() {
            return Err("Target URL is required".to_string());
        }

        let check = is_url_allowed(Some(&resolved_url), &workflow.settings.allowed_sites);
        if !check.allowed {
            return Err(check
                .reason
                .unwrap_or_else(|| "Target URL is not in the allowed list.".to_string()));
        }

        let tab_id = match state.tab_id {
            Some(id) => id,
            None => match self.page.find_tab(TabQuery::Active).await {
                Ok(Some(tab)) => {
                    state.tab_id = Some(tab.id);
                    if state.tab_url.is_none() {
                        state.tab_url = tab.url;
                    }
                    tab.id
                }
                _ => return Err(PageError::NoTab.to_string()),
            },
        };

        let timeout_ms = step.timeout_ms.unwrap_or(NAVIGATION_TIMEOUT_MS).max(1000);
        let initial_url = state.tab_url.clone();
        let mut events = self.page.subscribe_events();

        self.page_step(Some(tab_id), PageCommand::Navigate { url: resolved_url.clone() })
            .await?;

        let landed = self
            .wait_for_navigation(tab_id, &resolved_url, initial_url.as_deref(), timeout_ms, &mut events)
            .await?;

        state.tab_url = Some(landed);
        Ok(StepSuccess::Done)
    }

    /// Wait until the tab reports a completed navigation matching the
    /// target (or any URL change from the initial one), bounded by
    /// `timeout_ms`. Listens to pushed browser events and polls the tab as
    /// a fallback.
    async fn wait_for_navigation(
        &self,
        tab_id: i64,
        expected_url: &str,
        initial_url: Option<&str>,
        timeout_ms: u64,
        events: &mut tokio::sync::broadcast::Receiver<PageEvent>,
    ) -> Result<String, String> {
        let started = std::time::Instant::now();
        let deadline = Duration::from_millis(timeout_ms);
        let mut poll = tokio::time::interval(NAVIGATION_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(format!(
                    "Navigation timed out after {}ms",
                    started.elapsed().as_millis()
                ));
            }

            tokio::select! {
                event = tokio::time::timeout(remaining, events.recv()) => {
                    match event {
                        Ok(Ok(event)) => {
                            if event.tab_id != Some(tab_id) {
                                continue;
                            }
                            let Some(url) = event.url else { continue };
                            if navigation_landed(&url, expected_url, initial_url) {
                                return Ok(url);
                            }
                        }
                        Ok(Err(_)) => {
                            // Event stream lagged or closed; the poll below
                            // still observes the tab.
                        }
                        Err(_) => {
                            return Err(format!(
                                "Navigation timed out after {}ms",
                                started.elapsed().as_millis()
                            ));
                        }
                    }
                }
                _ = poll.tick() => {
                    if let Ok(tabs) = self.page.query_tabs(TabQuery::All).await {
                        if let Some(url) = tabs
                            .iter()
                            .find(|t| t.id == tab_id)
                            .and_then(|t| t.url.clone())
                        {
                            if navigation_landed(&url, expected_url, initial_url) {
                                return Ok(url);
                            }
                        }
                    }
                }
            }
        }
    }

    // ==================== evaluate ====================

    async fn evaluate(
        &self,
        workflow: &Workflow,
        step: &AtomicStep,
        cfg: &EvaluateConfig,
        state: &mut RunState,
    ) -> StepResult {
        let ctx = self.template_ctx(workflow, step, state);
        let code = apply_template(&cfg.code, &ctx).trim().to_string();
        if code.is_empty() {
            return Err("Code is required for evaluate".to_string());
        }

        let args = if cfg.mode == crate::workflow::schema::EvaluateMode::Expression {
            Vec::new()
        } else {
            prepare_args(&cfg.args, &ctx)?
        };

        let target_tab = self.resolve_evaluate_tab(cfg, &ctx, state).await?;

        let mut resolved_cfg = cfg.clone();
        resolved_cfg.code = code;

        let reply = self
            .page_step(
                target_tab,
                PageCommand::Evaluate {
                    evaluate: resolved_cfg,
                    args,
                    vars: state.vars.clone(),
                },
            )
            .await;

        let (ok, result, error) = match reply {
            Ok(PageReply::Evaluated { result }) => match validate_result(cfg, &result) {
                Ok(()) => (true, result, None),
                Err(msg) => (false, result, Some(msg)),
            },
            Ok(other) => (
                false,
                serde_json::Value::Null,
                Some(format!("Unexpected evaluate reply: {other:?}")),
            ),
            Err(e) => (false, serde_json::Value::Null, Some(e)),
        };

        if let Some(key) = cfg.save_as.as_deref() {
            let key = normalize_var_name(key);
            let should_save = !key.is_empty() && (ok || !cfg.save_only_if_ok);
            if should_save {
                let serialized = match &result {
                    serde_json::Value::String(s) => s.clone(),
                    other => serde_json::to_string(other).unwrap_or_default(),
                };
                self.save_var(workflow, state, &key, serialized);
            }
        }

        if ok {
            Ok(StepSuccess::Done)
        } else {
            Err(error.unwrap_or_else(|| "Evaluate failed".to_string()))
        }
    }

    async fn resolve_evaluate_tab(
        &self,
        cfg: &EvaluateConfig,
        ctx: &TemplateContext,
        state: &RunState,
    ) -> Result<Option<i64>, String> {
        match cfg.target {
            EvaluateTarget::CurrentTab => Ok(state.tab_id),
            EvaluateTarget::SpecificTab => {
                let raw = apply_template(cfg.specific_tab_id.as_deref().unwrap_or(""), ctx)
                    .trim()
                    .to_string();
                raw.parse::<i64>()
                    .map(Some)
                    .map_err(|_| "Invalid tab id for evaluate".to_string())
            }
            EvaluateTarget::AnyTabMatchingScope => {
                let regex = cfg.scope_url_regex.as_deref().unwrap_or("").trim().to_string();
                if regex.is_empty() {
                    return Err("Scope regex is required for tab matching".to_string());
                }
                match self
                    .page
                    .find_tab(TabQuery::ByScopeRegex { regex })
                    .await
                    .map_err(|e| e.to_string())?
                {
                    Some(tab) => Ok(Some(tab.id)),
                    None => Err("No tab matches the provided scope regex".to_string()),
                }
            }
        }
    }

    // ==================== screenshot ====================

    async fn screenshot(
        &self,
        workflow: &Workflow,
        step: &AtomicStep,
        cfg: &ScreenshotConfig,
        state: &mut RunState,
    ) -> StepResult {
        if cfg.capture_mode == CaptureMode::Element && cfg.selector.trim().is_empty() {
            return Err("Selector is required for element screenshot".to_string());
        }

        let ctx = self.template_ctx(workflow, step, state);
        let file_name = build_screenshot_file_name(&cfg.file_name_template, cfg.format, &ctx);

        let downgrade = |message: String| -> StepResult {
            match cfg.on_fail {
                ScreenshotOnFail::Continue => Ok(StepSuccess::Skipped {
                    reason: if message.is_empty() {
                        "Screenshot skipped".to_string()
                    } else {
                        message
                    },
                }),
                ScreenshotOnFail::Fail => Err(message),
            }
        };

        let reply = self
            .page_step(
                state.tab_id,
                PageCommand::Screenshot {
                    screenshot: cfg.clone(),
                    file_name: file_name.clone(),
                },
            )
            .await;

        let (data_url, base64, width, height) = match reply {
            Ok(PageReply::Screenshot {
                data_url,
                base64,
                width,
                height,
            }) if !data_url.is_empty() => (data_url, base64, width, height),
            Ok(_) => return downgrade("Screenshot failed".to_string()),
            Err(e) => return downgrade(e),
        };
        let base64 = base64.unwrap_or_else(|| {
            data_url
                .split_once(',')
                .map(|(_, b64)| b64.to_string())
                .unwrap_or_default()
        });

        // Server upload failure is judged by the same onFail policy but is
        // independent of capture success.
        if let Some(upload) = cfg.server_upload.as_ref().filter(|u| u.enabled) {
            let upload_ctx = ctx
                .with_extra("fileName", file_name.clone())
                .with_extra("dataField", upload.data_field.clone())
                .with_extra("data", base64.clone())
                .with_extra("dataUrl", data_url.clone())
                .with_extra("format", format!("{:?}", cfg.format).to_lowercase());
            let url = apply_template(&upload.url, &upload_ctx).trim().to_string();
            if url.is_empty() {
                return downgrade("Upload URL is required".to_string());
            }
            let body = match &upload.body_template {
                Some(template) => apply_template(template, &upload_ctx),
                None => {
                    let mut payload = serde_json::Map::new();
                    payload.insert(upload.data_field.clone(), serde_json::json!(base64));
                    payload.insert("fileName".to_string(), serde_json::json!(file_name));
                    payload.insert(
                        "format".to_string(),
                        serde_json::json!(format!("{:?}", cfg.format).to_lowercase()),
                    );
                    payload.insert("width".to_string(), serde_json::json!(width));
                    payload.insert("height".to_string(), serde_json::json!(height));
                    payload.insert("timestamp".to_string(), serde_json::json!(ctx.timestamp_ms));
                    serde_json::Value::Object(payload).to_string()
                }
            };
            if let Err(e) = self
                .post_raw(&upload.method, &url, &upload.headers, &upload_ctx, body, "Upload")
                .await
            {
                return downgrade(e);
            }
        }

        let sink_result: Result<(), String> = match cfg.save_to {
            ScreenshotSink::Downloads => self
                .page_step(
                    state.tab_id,
                    PageCommand::Download {
                        data_url: data_url.clone(),
                        file_name: file_name.clone(),
                    },
                )
                .await
                .map(|_| ()),
            ScreenshotSink::VarsBase64 => {
                let key = normalize_var_name(cfg.save_as.as_deref().unwrap_or("screenshot"));
                if !key.is_empty() {
                    self.save_var(workflow, state, &key, base64.clone());
                }
                Ok(())
            }
            ScreenshotSink::RunnerArtifacts => {
                let artifact = RunArtifact {
                    id: format!("{}-screenshot-{}", state.run_id, now_ms()),
                    kind: ArtifactKind::Screenshot,
                    name: file_name.clone(),
                    data_url: data_url.clone(),
                    created_at: now_ms(),
                    width,
                    height,
                };
                self.manager
                    .push_run_artifact(&workflow.id, &state.run_id, artifact);
                Ok(())
            }
        };

        if let Err(e) = sink_result {
            return downgrade(e);
        }
        Ok(StepSuccess::Done)
    }

    // ==================== helpers ====================

    pub(crate) fn template_ctx(
        &self,
        workflow: &Workflow,
        step: &AtomicStep,
        state: &RunState,
    ) -> TemplateContext {
        let mut ctx = TemplateContext::new(&workflow.id, &workflow.name);
        ctx.vars = state.vars.clone();
        ctx.step_id = Some(step.id.clone());
        ctx.step_name = Some(step.name.clone());
        ctx.url = state.tab_url.clone();
        ctx
    }

    fn save_var(&self, workflow: &Workflow, state: &mut RunState, key: &str, value: String) {
        state.vars.insert(key.to_string(), value.clone());
        if let Err(e) = self.manager.set_variable(&workflow.id, key, &value) {
            tracing::warn!(workflow = %workflow.id, key, "failed to persist variable: {e}");
        }
    }

    async fn page_step(
        &self,
        tab: Option<i64>,
        command: PageCommand,
    ) -> Result<PageReply, String> {
        self.page.execute(tab, command).await.map_err(|e| e.to_string())
    }

    async fn post_json(
        &self,
        method: &str,
        url: &str,
        headers: &[crate::workflow::schema::Header],
        ctx: &TemplateContext,
        body: serde_json::Value,
        label: &str,
    ) -> Result<(), String> {
        self.post_raw(method, url, headers, ctx, body.to_string(), label)
            .await
    }

    async fn post_raw(
        &self,
        method: &str,
        url: &str,
        headers: &[crate::workflow::schema::Header],
        ctx: &TemplateContext,
        body: String,
        label: &str,
    ) -> Result<(), String> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let mut req = self.http.request(method, url).body(body);

        let mut has_content_type = false;
        for header in headers {
            let key = apply_template(&header.key, ctx).trim().to_string();
            if key.is_empty() {
                continue;
            }
            if key.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            req = req.header(key, apply_template(&header.value, ctx));
        }
        if !has_content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, "application/json");
        }

        let resp = req.send().await.map_err(|e| format!("{label} failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let suffix = if text.is_empty() {
                String::new()
            } else {
                format!(": {text}")
            };
            return Err(format!("{label} failed with status {}{suffix}", status.as_u16()));
        }
        Ok(())
    }
}

/// Did the tab land where goTo wanted it?
///
/// Accepts an exact/prefix match on the target, an equal origin with a
/// matching path prefix, or any change away from the initial URL.
fn navigation_landed(candidate: &str, expected: &str, initial: Option<&str>) -> bool {
    if candidate.is_empty() {
        return false;
    }
    if candidate == expected || candidate.starts_with(expected) {
        return true;
    }
    if let (Some((exp_origin, exp_path)), Some((got_origin, got_path))) =
        (origin_and_path(expected), origin_and_path(candidate))
    {
        if exp_origin == got_origin && got_path.starts_with(&exp_path) {
            return true;
        }
    }
    match initial {
        Some(initial) => candidate != initial,
        None => true,
    }
}

fn origin_and_path(url: &str) -> Option<(String, String)> {
    let scheme_end = url.find("://")?;
    let scheme = &url[..scheme_end];
    let rest = &url[scheme_end + 3..];
    let (authority, path) = match rest.find(['/', '?', '#']) {
        Some(idx) if rest.as_bytes()[idx] == b'/' => {
            let (a, p) = rest.split_at(idx);
            (a, p.split(['?', '#']).next().unwrap_or("/").to_string())
        }
        Some(idx) => (&rest[..idx], "/".to_string()),
        None => (rest, "/".to_string()),
    };
    Some((format!("{scheme}://{authority}"), path))
}

fn host_of_url(url: &str) -> Option<String> {
    let (origin, _) = origin_and_path(url)?;
    let authority = origin.split("://").nth(1)?;
    let host = authority
        .rsplit('@')
        .next()
        .unwrap_or(authority)
        .split(':')
        .next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Coerce evaluate arguments to their declared types. Coercion failure is
/// an error naming the offending argument.
fn prepare_args(args: &[EvaluateArg], ctx: &TemplateContext) -> Result<Vec<ResolvedArg>, String> {
    args.iter()
        .enumerate()
        .map(|(idx, arg)| {
            let raw = apply_template(&arg.value, ctx);
            let name = if arg.name.trim().is_empty() {
                format!("arg{}", idx + 1)
            } else {
                arg.name.trim().to_string()
            };
            let value = coerce_arg(&raw, arg.arg_type)
                .map_err(|msg| format!("Argument \"{name}\" is invalid: {msg}"))?;
            Ok(ResolvedArg { name, value })
        })
        .collect()
}

fn coerce_arg(raw: &str, arg_type: ArgType) -> Result<serde_json::Value, String> {
    match arg_type {
        ArgType::String => Ok(serde_json::Value::String(raw.to_string())),
        ArgType::Number => {
            let num: f64 = raw
                .trim()
                .parse()
                .map_err(|_| "Expected a number".to_string())?;
            serde_json::Number::from_f64(num)
                .map(serde_json::Value::Number)
                .ok_or_else(|| "Expected a finite number".to_string())
        }
        ArgType::Boolean => {
            let val = raw.trim().to_ascii_lowercase();
            if ["true", "1", "yes", "on"].contains(&val.as_str()) {
                Ok(serde_json::Value::Bool(true))
            } else if ["false", "0", "no", "off", ""].contains(&val.as_str()) {
                Ok(serde_json::Value::Bool(false))
            } else {
                Ok(serde_json::Value::Bool(true))
            }
        }
        ArgType::Json => {
            let text = if raw.trim().is_empty() { "null" } else { raw };
            serde_json::from_str(text).map_err(|e| format!("Invalid JSON: {e}"))
        }
    }
}

/// Check the evaluate result against the declared expectation.
fn validate_result(cfg: &EvaluateConfig, value: &serde_json::Value) -> Result<(), String> {
    use serde_json::Value;
    let mismatch = match cfg.expect {
        ExpectedType::Any => None,
        ExpectedType::String => (!value.is_string()).then_some("Expected a string result"),
        ExpectedType::Number => (!value.is_number()).then_some("Expected a number result"),
        ExpectedType::Boolean => (!value.is_boolean()).then_some("Expected a boolean result"),
        ExpectedType::Object => (!value.is_object()).then_some("Expected an object result"),
        ExpectedType::Array => (!value.is_array()).then_some("Expected an array result"),
    };
    if let Some(msg) = mismatch {
        return Err(msg.to_string());
    }
    if cfg.fail_on_falsy {
        let falsy = match value {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Number(n) => n.as_f64() == Some(0.0),
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if falsy {
            return Err("Result is falsy".to_string());
        }
    }
    Ok(())
}

/// Apply the file-name template, sanitize, and ensure the extension.
fn build_screenshot_file_name(
    template: &str,
    format: ImageFormat,
    ctx: &TemplateContext,
) -> String {
    let applied = apply_template(template, ctx).trim().to_string();
    let base = if applied.is_empty() {
        format!("screenshot_{}", ctx.timestamp_ms / 1000)
    } else {
        applied
    };
    let sanitized: String = base
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    let sanitized = sanitized.trim_end_matches('.').to_string();
    let ext = format.extension();
    if sanitized.to_ascii_lowercase().ends_with(&format!(".{ext}")) {
        sanitized
    } else {
        format!("{sanitized}.{ext}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_landed_matches() {
        assert!(navigation_landed(
            "https://a.test/cart",
            "https://a.test/cart",
            None
        ));
        assert!(navigation_landed(
            "https://a.test/cart?step=2",
            "https://a.test/cart",
            Some("https://a.test/cart?step=2")
        ));
        assert!(navigation_landed(
            "https://a.test/cart/items",
            "https://a.test/cart",
            Some("https://a.test/cart/items")
        ));
        // Any change away from the initial URL counts.
        assert!(navigation_landed(
            "https://b.test/elsewhere",
            "https://a.test/cart",
            Some("https://a.test/home")
        ));
        assert!(!navigation_landed(
            "https://a.test/home",
            "https://a.test/cart",
            Some("https://a.test/home")
        ));
    }

    #[test]
    fn test_coerce_number_arg() {
        assert_eq!(coerce_arg("42", ArgType::Number).unwrap(), serde_json::json!(42.0));
        let err = coerce_arg("forty", ArgType::Number).unwrap_err();
        assert_eq!(err, "Expected a number");
    }

    #[test]
    fn test_coerce_boolean_arg() {
        assert_eq!(coerce_arg("YES", ArgType::Boolean).unwrap(), serde_json::json!(true));
        assert_eq!(coerce_arg("0", ArgType::Boolean).unwrap(), serde_json::json!(false));
        assert_eq!(coerce_arg("", ArgType::Boolean).unwrap(), serde_json::json!(false));
        assert_eq!(coerce_arg("weird", ArgType::Boolean).unwrap(), serde_json::json!(true));
    }

    #[test]
    fn test_prepare_args_names_offender() {
        let ctx = TemplateContext::new("wf", "wf");
        let args = vec![EvaluateArg {
            name: "count".to_string(),
            value: "not-a-number".to_string(),
            arg_type: ArgType::Number,
        }];
        let err = prepare_args(&args, &ctx).unwrap_err();
        assert_eq!(err, "Argument \"count\" is invalid: Expected a number");
    }

    #[test]
    fn test_validate_result_expectations() {
        let mut cfg = EvaluateConfig {
            mode: Default::default(),
            code: "1".to_string(),
            args: vec![],
            target: Default::default(),
            specific_tab_id: None,
            scope_url_regex: None,
            expect: ExpectedType::Number,
            fail_on_falsy: false,
            save_as: None,
            save_only_if_ok: true,
        };
        assert!(validate_result(&cfg, &serde_json::json!(3)).is_ok());
        assert!(validate_result(&cfg, &serde_json::json!("3")).is_err());

        cfg.expect = ExpectedType::Any;
        cfg.fail_on_falsy = true;
        assert!(validate_result(&cfg, &serde_json::json!("")).is_err());
        assert!(validate_result(&cfg, &serde_json::json!("ok")).is_ok());
    }

    #[test]
    fn test_screenshot_file_name() {
        let mut ctx = TemplateContext::new("wf-1", "My Flow");
        ctx.step_name = Some("Grab / Shot".to_string());
        ctx.timestamp_ms = 1_700_000_000_000;
        let name = build_screenshot_file_name(
            "{{workflow}}_{{step}}_{{timestamp}}",
            ImageFormat::Jpeg,
            &ctx,
        );
        assert_eq!(name, "My_Flow_Grab___Shot_1700000000.jpg");
    }

    #[test]
    fn test_host_of_url() {
        assert_eq!(host_of_url("https://a.test:8443/x"), Some("a.test".to_string()));
        assert_eq!(host_of_url("notaurl"), None);
    }
}
