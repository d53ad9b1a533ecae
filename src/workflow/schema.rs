//! Workflow data structures and serialization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A workflow definition: an ordered sequence of automation steps plus the
/// triggers that may start it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub steps: Vec<StepNode>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Named string variables, readable from step templates as `{{vars.*}}`.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Run history, newest first.
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub run_count: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            status: WorkflowStatus::Paused,
            steps: Vec::new(),
            triggers: Vec::new(),
            variables: HashMap::new(),
            settings: WorkflowSettings::default(),
            runs: Vec::new(),
            run_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Steps and triggers are frozen while a workflow is active; only a
    /// paused workflow may be structurally edited.
    pub fn is_active(&self) -> bool {
        self.status != WorkflowStatus::Paused
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Idle,
    #[default]
    Paused,
    Error,
}

/// Per-workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// Default per-step timeout in milliseconds.
    #[serde(default = "default_step_timeout")]
    pub default_timeout_ms: u64,
    /// Whole-run retries after a failed attempt (0 = no retry).
    #[serde(default)]
    pub max_retries: u32,
    /// Sites the workflow may touch. Empty list denies everything.
    #[serde(default)]
    pub allowed_sites: Vec<AllowedSite>,
    /// Concurrency rule applied when a trigger fires while runs are active.
    #[serde(default)]
    pub trigger_policy: TriggerRunPolicy,
    /// Webhook socket endpoint for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<String>,
    /// Runtime flag: socket currently open.
    #[serde(default)]
    pub ws_connected: bool,
    /// User explicitly asked for the socket (keeps it alive while paused).
    #[serde(default)]
    pub ws_connect_requested: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_step_timeout(),
            max_retries: 0,
            allowed_sites: Vec::new(),
            trigger_policy: TriggerRunPolicy::default(),
            ws_endpoint: None,
            ws_connected: false,
            ws_connect_requested: false,
        }
    }
}

fn default_step_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllowedSite {
    pub host: String,
    #[serde(default)]
    pub favicon: String,
}

/// Concurrency rule for overlapping trigger firings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRunPolicy {
    pub mode: TriggerPolicyMode,
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: u32,
}

impl Default for TriggerRunPolicy {
    fn default() -> Self {
        Self {
            mode: TriggerPolicyMode::Single,
            parallel_limit: default_parallel_limit(),
        }
    }
}

fn default_parallel_limit() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicyMode {
    /// Reject new firings while any run is active.
    Single,
    /// Cancel active runs, then admit the new firing.
    Restart,
    /// Admit up to `parallel_limit` concurrent runs.
    Parallel,
}

// ==================== Steps ====================

/// One entry in a workflow's step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepNode {
    Step(AtomicStep),
    IfElse(ConditionalBlock),
}

impl StepNode {
    pub fn id(&self) -> &str {
        match self {
            StepNode::Step(s) => &s.id,
            StepNode::IfElse(b) => &b.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StepNode::Step(s) => &s.name,
            StepNode::IfElse(b) => &b.name,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            StepNode::Step(s) => s.enabled,
            StepNode::IfElse(b) => b.enabled,
        }
    }
}

/// One atomic browser action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicStep {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Step timeout in milliseconds; falls back to the workflow default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Declared retry budget, enforced by the step kind where meaningful.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Target step id, only meaningful for `OnFailure::Goto`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_step: Option<String>,
    /// Recovery snippet, only meaningful for `OnFailure::Fallback`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_code: Option<String>,
    #[serde(flatten)]
    pub action: StepAction,
}

pub(crate) fn default_true() -> bool {
    true
}

/// What happens when a step's action fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Stop,
    Skip,
    Goto,
    Fallback,
}

/// Step kind plus its kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StepAction {
    GoTo {
        url: String,
    },
    Click {
        selector: String,
        #[serde(default)]
        click_mode: ClickMode,
    },
    TypeText {
        selector: String,
        #[serde(default)]
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_source: Option<ValueSource>,
    },
    Select {
        selector: String,
        #[serde(default)]
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_source: Option<ValueSource>,
    },
    Wait {
        wait: WaitConfig,
    },
    Scroll {
        scroll: ScrollConfig,
    },
    Evaluate {
        evaluate: EvaluateConfig,
    },
    Extract {
        extract: ExtractConfig,
    },
    Request {
        request: RequestConfig,
    },
    SendCookies {
        upload: CookieUploadConfig,
    },
    SendPageSource {
        upload: PageSourceUploadConfig,
    },
    Screenshot {
        screenshot: ScreenshotConfig,
    },
}

impl StepAction {
    /// Stable kind name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::GoTo { .. } => "goTo",
            StepAction::Click { .. } => "click",
            StepAction::TypeText { .. } => "type",
            StepAction::Select { .. } => "select",
            StepAction::Wait { .. } => "wait",
            StepAction::Scroll { .. } => "scroll",
            StepAction::Evaluate { .. } => "evaluate",
            StepAction::Extract { .. } => "extract",
            StepAction::Request { .. } => "request",
            StepAction::SendCookies { .. } => "sendCookies",
            StepAction::SendPageSource { .. } => "sendPageSource",
            StepAction::Screenshot { .. } => "screenshot",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ClickMode {
    #[default]
    Single,
    Double,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitConfig {
    pub wait_for: WaitFor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_regex: Option<String>,
    /// Plain delay for `WaitFor::Time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(default = "default_wait_interval")]
    pub interval_ms: u64,
    #[serde(default)]
    pub strategy: WaitStrategy,
}

fn default_wait_interval() -> u64 {
    250
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WaitFor {
    Time,
    SelectorAppears,
    SelectorVisible,
    SelectorHidden,
    SelectorDisappears,
    TextContains,
    AttributeEquals,
    ElementEnabled,
    UrlMatches,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum WaitStrategy {
    #[default]
    Observer,
    Polling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollConfig {
    #[serde(default)]
    pub scroll_type: ScrollType,
    #[serde(default)]
    pub behavior: ScrollBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScrollType {
    #[default]
    ToSelector,
    IntoView,
    ToPosition,
    ByAmount,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScrollBehavior {
    #[default]
    Smooth,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateConfig {
    #[serde(default)]
    pub mode: EvaluateMode,
    pub code: String,
    #[serde(default)]
    pub args: Vec<EvaluateArg>,
    #[serde(default)]
    pub target: EvaluateTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_tab_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_url_regex: Option<String>,
    #[serde(default)]
    pub expect: ExpectedType,
    #[serde(default)]
    pub fail_on_falsy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
    #[serde(default = "default_true")]
    pub save_only_if_ok: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum EvaluateMode {
    #[default]
    Expression,
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArg {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub arg_type: ArgType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ArgType {
    #[default]
    String,
    Number,
    Boolean,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum EvaluateTarget {
    #[default]
    CurrentTab,
    SpecificTab,
    AnyTabMatchingScope,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExpectedType {
    #[default]
    Any,
    String,
    Number,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractConfig {
    pub selector: String,
    #[serde(default)]
    pub extract_what: ExtractWhat,
    #[serde(default)]
    pub attribute_name: String,
    #[serde(default)]
    pub multiple: ExtractMultiple,
    #[serde(default = "default_join_with")]
    pub join_with: String,
    #[serde(default)]
    pub output_type: OutputType,
    #[serde(default = "default_true")]
    pub trim: bool,
    #[serde(default)]
    pub default_value: String,
    #[serde(default)]
    pub fail_if_empty: bool,
    /// Regex filter; elements whose value does not match are dropped.
    #[serde(default)]
    pub regex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
}

fn default_join_with() -> String {
    "\n".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExtractWhat {
    #[default]
    Text,
    TextContent,
    Html,
    Value,
    Attribute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExtractMultiple {
    #[default]
    First,
    All,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum OutputType {
    String,
    Number,
    Boolean,
    Json,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    pub url: String,
    #[serde(default = "default_get")]
    pub method: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: String,
    /// Dot/bracket path walked into the JSON response before saving.
    #[serde(default)]
    pub response_json_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_to: Option<String>,
}

fn default_get() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieUploadConfig {
    pub server_url: String,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Send every cookie visible for the tab (default), or only `cookie_names`.
    #[serde(default = "default_true")]
    pub cookie_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_domain: Option<String>,
    #[serde(default)]
    pub cookie_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSourceUploadConfig {
    pub server_url: String,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<Header>,
}

fn default_post() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotConfig {
    #[serde(default)]
    pub capture_mode: CaptureMode,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_file_name_template")]
    pub file_name_template: String,
    #[serde(default)]
    pub save_to: ScreenshotSink,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
    #[serde(default)]
    pub on_fail: ScreenshotOnFail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_upload: Option<ServerUploadConfig>,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            capture_mode: CaptureMode::default(),
            selector: String::new(),
            format: ImageFormat::default(),
            quality: default_quality(),
            file_name_template: default_file_name_template(),
            save_to: ScreenshotSink::default(),
            save_as: None,
            on_fail: ScreenshotOnFail::default(),
            server_upload: None,
        }
    }
}

fn default_quality() -> u8 {
    90
}

fn default_file_name_template() -> String {
    "{{workflow}}_{{step}}_{{timestamp}}".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CaptureMode {
    #[default]
    Viewport,
    FullPage,
    Element,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScreenshotSink {
    #[default]
    Downloads,
    VarsBase64,
    RunnerArtifacts,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScreenshotOnFail {
    /// Record the step as skipped and keep going.
    #[default]
    Continue,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUploadConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: String,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default = "default_data_field")]
    pub data_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_template: Option<String>,
}

fn default_data_field() -> String {
    "screenshot".to_string()
}

// ==================== Value sources ====================

/// Where a `type`/`select` step's input comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum ValueSource {
    Fixed { value: String },
    Request { request: RequestSourceConfig },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSourceConfig {
    pub url: String,
    #[serde(default = "default_get")]
    pub method: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub response_json_path: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Conditional retry for request-backed values: re-issue while the
/// condition holds, up to `max_retries` extra attempts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_value_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RetryCondition>,
}

fn default_value_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "conditionType", rename_all = "camelCase")]
pub enum RetryCondition {
    JsonField {
        field: String,
        operator: CompareOperator,
        value: String,
    },
    StatusCode {
        expected: u16,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CompareOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
}

// ==================== Conditions & blocks ====================

/// An if/else block: the condition picks which branch of atomic steps runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalBlock {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub condition: Condition,
    #[serde(default)]
    pub if_steps: Vec<AtomicStep>,
    #[serde(default)]
    pub else_steps: Vec<AtomicStep>,
    /// Applied when the chosen branch (or the condition itself) fails.
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_code: Option<String>,
}

/// Branch condition. Page conditions are evaluated on the tab; variable
/// conditions are evaluated in the engine against the run's variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Condition {
    SelectorExists { selector: String },
    SelectorNotExists { selector: String },
    ElementVisible { selector: String },
    ElementHidden { selector: String },
    ElementEnabled { selector: String },
    ElementDisabled { selector: String },
    TextContains { selector: String, text: String },
    TextEquals { selector: String, text: String },
    TextNotContains { selector: String, text: String },
    AttributeEquals { selector: String, attribute_name: String, attribute_value: String },
    AttributeContains { selector: String, attribute_name: String, attribute_value: String },
    UrlMatches { url_pattern: String },
    UrlEquals { url_pattern: String },
    RegexMatches { selector: String, regex_pattern: String },
    VariableEquals { variable: String, value: String },
    VariableNotEquals { variable: String, value: String },
    VariableGreater { variable: String, value: String },
    VariableLess { variable: String, value: String },
    VariableEmpty { variable: String },
    VariableNotEmpty { variable: String },
}

impl Condition {
    /// True when the condition reads engine state instead of the page.
    pub fn is_variable_condition(&self) -> bool {
        matches!(
            self,
            Condition::VariableEquals { .. }
                | Condition::VariableNotEquals { .. }
                | Condition::VariableGreater { .. }
                | Condition::VariableLess { .. }
                | Condition::VariableEmpty { .. }
                | Condition::VariableNotEmpty { .. }
        )
    }
}

// ==================== Triggers ====================

/// A source that can start a run automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub config: TriggerConfig,
    /// Last admitted firing, Unix ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "triggerType", rename_all = "camelCase")]
pub enum TriggerConfig {
    Schedule(ScheduleTriggerConfig),
    BrowserEvent(BrowserEventConfig),
    DomCondition(DomConditionConfig),
    WebhookWs(WebhookWsConfig),
}

impl TriggerConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerConfig::Schedule(_) => "schedule",
            TriggerConfig::BrowserEvent(_) => "browserEvent",
            TriggerConfig::DomCondition(_) => "domCondition",
            TriggerConfig::WebhookWs(_) => "webhookWs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleTriggerConfig {
    pub mode: ScheduleMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_ms: Option<u64>,
    /// "HH:MM" for `DailyAt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_time: Option<String>,
    /// 5-field expression for `CronLike`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: ScheduleTimezone,
    #[serde(default)]
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleMode {
    EveryMinutes,
    EveryMs,
    DailyAt,
    CronLike,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleTimezone {
    #[default]
    Local,
    Utc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserEventConfig {
    pub event: BrowserEventKind,
    pub url_match: UrlMatchType,
    #[serde(default)]
    pub url_value: String,
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub only_if_tab_active: bool,
    #[serde(default)]
    pub run_once_per_session: bool,
}

fn default_debounce() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum BrowserEventKind {
    NavigationCompleted,
    TabsUpdated,
    TabsActivated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UrlMatchType {
    HostEquals,
    Contains,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomConditionConfig {
    pub condition: DomConditionKind,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_value: Option<String>,
    #[serde(default = "default_dom_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub fire_mode: FireMode,
    #[serde(default)]
    pub target_tab: TargetTabScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_url_regex: Option<String>,
}

fn default_dom_timeout() -> u64 {
    10_000
}

fn default_cooldown() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DomConditionKind {
    SelectorAppears,
    SelectorDisappears,
    TextContains,
    AttributeEquals,
    ElementEnabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FireMode {
    #[default]
    Once,
    EveryTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TargetTabScope {
    #[default]
    CurrentTab,
    AnyTabMatchingScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookWsConfig {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub dedupe_window_ms: u64,
}

// ==================== Runs ====================

/// One end-to-end execution attempt of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub steps: Vec<StepRecord>,
    pub context: RunContext,
    #[serde(default)]
    pub artifacts: Vec<RunArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// What started the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    #[default]
    Manual,
    Schedule,
    Dom,
    Browser,
    Websocket,
}

/// One line of a run's step timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    /// Variable snapshot taken when the run started.
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub name: String,
    pub data_url: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step(id: &str, action: StepAction) -> AtomicStep {
        AtomicStep {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            timeout_ms: None,
            retries: 0,
            on_failure: OnFailure::Stop,
            goto_step: None,
            fallback_code: None,
            action,
        }
    }

    #[test]
    fn test_workflow_serialization() {
        let mut workflow = Workflow::new("Test Workflow");
        workflow.steps.push(StepNode::Step(sample_step(
            "step1",
            StepAction::GoTo {
                url: "https://example.com".to_string(),
            },
        )));

        let json = serde_json::to_string(&workflow).unwrap();
        let parsed: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.steps.len(), 1);
        match &parsed.steps[0] {
            StepNode::Step(s) => assert_eq!(s.action.kind(), "goTo"),
            StepNode::IfElse(_) => panic!("expected atomic step"),
        }
    }

    #[test]
    fn test_step_node_tagging() {
        let block = StepNode::IfElse(ConditionalBlock {
            id: "b1".to_string(),
            name: "Check".to_string(),
            enabled: true,
            condition: Condition::SelectorExists {
                selector: "#out".to_string(),
            },
            if_steps: vec![sample_step(
                "s1",
                StepAction::Click {
                    selector: "#btn".to_string(),
                    click_mode: ClickMode::Single,
                },
            )],
            else_steps: vec![],
            on_failure: OnFailure::Skip,
            goto_step: None,
            fallback_code: None,
        });

        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "ifElse");
        let parsed: StepNode = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.id(), "b1");
        assert!(parsed.enabled());
    }

    #[test]
    fn test_trigger_config_roundtrip() {
        let trigger = Trigger {
            id: "t1".to_string(),
            name: "Nightly".to_string(),
            enabled: true,
            config: TriggerConfig::Schedule(ScheduleTriggerConfig {
                mode: ScheduleMode::DailyAt,
                every_minutes: None,
                every_ms: None,
                daily_time: Some("09:30".to_string()),
                cron_expression: None,
                timezone: ScheduleTimezone::Utc,
                jitter_ms: 250,
            }),
            last_event: None,
        };

        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["triggerType"], "schedule");
        let parsed: Trigger = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.config.kind(), "schedule");
    }

    #[test]
    fn test_run_roundtrip_preserves_timeline() {
        let run = Run {
            id: "run-1".to_string(),
            workflow_id: "wf-1".to_string(),
            status: RunStatus::Failed,
            trigger: RunTrigger::Schedule,
            start_time: 1000,
            end_time: Some(2500),
            duration_ms: Some(1500),
            steps: vec![
                StepRecord {
                    id: "s1".to_string(),
                    name: "Go".to_string(),
                    status: StepStatus::Success,
                    duration_ms: Some(400),
                    error: None,
                },
                StepRecord {
                    id: "s2".to_string(),
                    name: "Click".to_string(),
                    status: StepStatus::Skipped,
                    duration_ms: Some(10),
                    error: Some("Element not found".to_string()),
                },
                StepRecord {
                    id: "s3".to_string(),
                    name: "Extract".to_string(),
                    status: StepStatus::Failed,
                    duration_ms: Some(90),
                    error: Some("Extracted value is empty".to_string()),
                },
            ],
            context: RunContext::default(),
            artifacts: vec![],
            error: Some("Extracted value is empty".to_string()),
        };

        let json = serde_json::to_string(&run).unwrap();
        let parsed: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.steps, run.steps);
        assert_eq!(parsed.status, RunStatus::Failed);
    }

    #[test]
    fn test_default_settings() {
        let settings = WorkflowSettings::default();
        assert_eq!(settings.default_timeout_ms, 5000);
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.trigger_policy.mode, TriggerPolicyMode::Single);
        assert_eq!(settings.trigger_policy.parallel_limit, 2);
    }
}
