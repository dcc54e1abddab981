//! 工具白名单与参数契约
//!
//! Planner 是不可信的提议者：它给出的 `{"tool": ..., "args": {...}}` 必须先通过
//! BrowserToolCall::from_proposal 校验，才会交给 ToolClient 派发。会话创建与整段回放
//! 不在 BrowserToolCall 中，只能由编排器/回放引擎经 RemoteCall 发出。

use serde_json::{Map, Value};
use url::Url;

use crate::core::AgentError;
use crate::flow::FlowState;

/// 远端（MCP）工具名
pub mod remote {
    pub const SESSION_CREATE: &str = "browserbase_session_create";
    pub const SESSION_CLOSE: &str = "browserbase_session_close";
    pub const NAVIGATE: &str = "browserbase_stagehand_navigate";
    pub const OBSERVE: &str = "browserbase_stagehand_observe";
    pub const ACT: &str = "browserbase_stagehand_act";
    pub const EXTRACT: &str = "browserbase_stagehand_extract";
    pub const SCREENSHOT: &str = "browserbase_stagehand_screenshot";
    pub const GET_URL: &str = "browserbase_stagehand_get_url";
}

/// Planner 可见的工具：(名称, 参数说明, 用途)
pub const ALLOWED_TOOLS: &[(&str, &str, &str)] = &[
    ("navigate", "{\"url\": \"https://...\"}", "Open a URL in the browser session."),
    (
        "observe",
        "{\"instruction\": \"...\", \"returnAction\": true?}",
        "Find elements matching an instruction; returns deterministic locators.",
    ),
    (
        "perform",
        "{\"action\": \"...\"} or {\"observation\": {...}}, optional \"variables\": {...}",
        "Perform one action. Pass exactly one of `action` (natural language) or `observation` (a locator returned by observe). This is the only tool that records an action.",
    ),
    ("extract", "{\"instruction\": \"...\"}", "Extract information from the current page."),
    ("screenshot", "{}", "Capture a screenshot of the current page."),
    ("get_url", "{}", "Return the current page URL."),
    ("session_close", "{}", "Close the browser session. Only use when the task is finished."),
];

/// perform 的意图：自然语言或确定性定位器，二者必居其一
#[derive(Debug, Clone, PartialEq)]
pub enum PerformIntent {
    Action(String),
    Observation(Map<String, Value>),
}

/// 已校验的、Planner 可选的工具调用
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserToolCall {
    Navigate {
        url: String,
    },
    Observe {
        instruction: String,
        return_action: Option<bool>,
    },
    Perform {
        intent: PerformIntent,
        variables: Option<Map<String, Value>>,
    },
    Extract {
        instruction: String,
    },
    Screenshot,
    GetUrl,
    SessionClose,
}

fn contract(msg: impl Into<String>) -> AgentError {
    AgentError::ToolContract(msg.into())
}

/// 取出参数对象，拒绝白名单外的键；flowState 由编排器附加，Planner 提供的副本直接丢弃
fn take_args(tool: &str, args: &Value, allowed: &[&str]) -> Result<Map<String, Value>, AgentError> {
    let mut map = match args {
        Value::Null => Map::new(),
        Value::Object(m) => m.clone(),
        other => {
            return Err(contract(format!(
                "arguments for '{tool}' must be a JSON object, got {other}"
            )))
        }
    };
    map.remove("flowState");
    map.remove("flow_state");
    if let Some(unknown) = map.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(contract(format!(
            "'{tool}' does not accept argument '{unknown}' (allowed: {})",
            if allowed.is_empty() { "none".to_string() } else { allowed.join(", ") }
        )));
    }
    Ok(map)
}

fn required_text(tool: &str, map: &Map<String, Value>, key: &str) -> Result<String, AgentError> {
    match map.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(contract(format!("'{tool}' requires a non-empty '{key}'"))),
        Some(other) => Err(contract(format!("'{tool}.{key}' must be a string, got {other}"))),
        None => Err(contract(format!("'{tool}' requires '{key}'"))),
    }
}

fn optional_object(
    tool: &str,
    map: &Map<String, Value>,
    key: &str,
) -> Result<Option<Map<String, Value>>, AgentError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(o)) => Ok(Some(o.clone())),
        Some(other) => Err(contract(format!("'{tool}.{key}' must be an object, got {other}"))),
    }
}

impl BrowserToolCall {
    /// 校验 Planner 提议；任何违规都返回 ToolContract，且不会触达 ToolClient
    pub fn from_proposal(tool: &str, args: &Value) -> Result<Self, AgentError> {
        let tool = tool.trim();
        match tool {
            "navigate" => {
                let map = take_args(tool, args, &["url"])?;
                let raw = required_text(tool, &map, "url")?;
                let parsed = Url::parse(&raw)
                    .map_err(|e| contract(format!("'navigate.url' is not a valid URL ({raw}): {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(contract(format!(
                        "'navigate.url' must be http(s), got scheme '{}'",
                        parsed.scheme()
                    )));
                }
                Ok(BrowserToolCall::Navigate { url: raw })
            }
            "observe" => {
                let map = take_args(tool, args, &["instruction", "returnAction", "return_action"])?;
                let instruction = required_text(tool, &map, "instruction")?;
                let return_action = match map.get("returnAction").or_else(|| map.get("return_action")) {
                    None | Some(Value::Null) => None,
                    Some(Value::Bool(b)) => Some(*b),
                    Some(other) => {
                        return Err(contract(format!(
                            "'observe.returnAction' must be a boolean, got {other}"
                        )))
                    }
                };
                Ok(BrowserToolCall::Observe { instruction, return_action })
            }
            "perform" => {
                let map = take_args(tool, args, &["action", "observation", "variables"])?;
                let has_action = map.get("action").is_some_and(|v| !v.is_null());
                let has_observation = map.get("observation").is_some_and(|v| !v.is_null());
                let intent = match (has_action, has_observation) {
                    (true, false) => PerformIntent::Action(required_text(tool, &map, "action")?),
                    (false, true) => match optional_object(tool, &map, "observation")? {
                        Some(o) if !o.is_empty() => PerformIntent::Observation(o),
                        _ => return Err(contract("'perform.observation' must be a non-empty object")),
                    },
                    (true, true) => {
                        return Err(contract(
                            "'perform' takes exactly one of 'action' or 'observation', got both",
                        ))
                    }
                    (false, false) => {
                        return Err(contract(
                            "'perform' requires exactly one of 'action' or 'observation', got neither",
                        ))
                    }
                };
                let variables = optional_object(tool, &map, "variables")?;
                Ok(BrowserToolCall::Perform { intent, variables })
            }
            "extract" => {
                let map = take_args(tool, args, &["instruction"])?;
                Ok(BrowserToolCall::Extract {
                    instruction: required_text(tool, &map, "instruction")?,
                })
            }
            "screenshot" => take_args(tool, args, &[]).map(|_| BrowserToolCall::Screenshot),
            "get_url" => take_args(tool, args, &[]).map(|_| BrowserToolCall::GetUrl),
            "session_close" => take_args(tool, args, &[]).map(|_| BrowserToolCall::SessionClose),
            other => Err(contract(format!(
                "tool '{other}' is not in the allow-list ({})",
                ALLOWED_TOOLS.iter().map(|(n, _, _)| *n).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Planner 侧名称
    pub fn name(&self) -> &'static str {
        match self {
            BrowserToolCall::Navigate { .. } => "navigate",
            BrowserToolCall::Observe { .. } => "observe",
            BrowserToolCall::Perform { .. } => "perform",
            BrowserToolCall::Extract { .. } => "extract",
            BrowserToolCall::Screenshot => "screenshot",
            BrowserToolCall::GetUrl => "get_url",
            BrowserToolCall::SessionClose => "session_close",
        }
    }

    pub fn remote_name(&self) -> &'static str {
        match self {
            BrowserToolCall::Navigate { .. } => remote::NAVIGATE,
            BrowserToolCall::Observe { .. } => remote::OBSERVE,
            BrowserToolCall::Perform { .. } => remote::ACT,
            BrowserToolCall::Extract { .. } => remote::EXTRACT,
            BrowserToolCall::Screenshot => remote::SCREENSHOT,
            BrowserToolCall::GetUrl => remote::GET_URL,
            BrowserToolCall::SessionClose => remote::SESSION_CLOSE,
        }
    }

    /// 只有 perform 可以追加 actions
    pub fn appends_action(&self) -> bool {
        matches!(self, BrowserToolCall::Perform { .. })
    }

    /// 远端参数（不含 flowState）
    pub fn arguments(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            BrowserToolCall::Navigate { url } => {
                map.insert("url".into(), Value::String(url.clone()));
            }
            BrowserToolCall::Observe { instruction, return_action } => {
                map.insert("instruction".into(), Value::String(instruction.clone()));
                if let Some(r) = return_action {
                    map.insert("returnAction".into(), Value::Bool(*r));
                }
            }
            BrowserToolCall::Perform { intent, variables } => {
                match intent {
                    PerformIntent::Action(text) => {
                        map.insert("action".into(), Value::String(text.clone()));
                    }
                    PerformIntent::Observation(obs) => {
                        map.insert("observation".into(), Value::Object(obs.clone()));
                    }
                }
                if let Some(vars) = variables {
                    map.insert("variables".into(), Value::Object(vars.clone()));
                }
            }
            BrowserToolCall::Extract { instruction } => {
                map.insert("instruction".into(), Value::String(instruction.clone()));
            }
            BrowserToolCall::Screenshot | BrowserToolCall::GetUrl | BrowserToolCall::SessionClose => {}
        }
        map
    }
}

/// 实际发往远端的调用：Planner 可选工具、会话创建（仅编排器）、整段回放（仅回放引擎）
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    SessionCreate,
    Tool(BrowserToolCall),
    Replay(FlowState),
}

impl RemoteCall {
    pub fn remote_name(&self) -> &'static str {
        match self {
            RemoteCall::SessionCreate => remote::SESSION_CREATE,
            RemoteCall::Tool(call) => call.remote_name(),
            RemoteCall::Replay(_) => remote::ACT,
        }
    }

    /// 回放调用只携带 replayState，不附加增量 flowState
    pub fn carries_flow_state(&self) -> bool {
        !matches!(self, RemoteCall::Replay(_))
    }

    pub fn arguments(&self) -> Map<String, Value> {
        match self {
            RemoteCall::SessionCreate => Map::new(),
            RemoteCall::Tool(call) => call.arguments(),
            RemoteCall::Replay(state) => {
                let mut map = Map::new();
                map.insert("replayState".into(), state.to_value());
                map
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rejected(tool: &str, args: Value) -> String {
        match BrowserToolCall::from_proposal(tool, &args) {
            Err(AgentError::ToolContract(msg)) => msg,
            other => panic!("expected ToolContract for {tool} {args}, got {:?}", other),
        }
    }

    #[test]
    fn test_perform_requires_exactly_one_intent() {
        assert!(rejected("perform", json!({})).contains("neither"));
        assert!(rejected("perform", json!({"action": "click", "observation": {"selector": "#a"}}))
            .contains("both"));
        assert!(rejected("perform", json!({"action": ""})).contains("non-empty"));

        let call = BrowserToolCall::from_proposal("perform", &json!({"action": "click login"})).unwrap();
        assert!(call.appends_action());
        assert_eq!(call.arguments()["action"], "click login");

        let call = BrowserToolCall::from_proposal(
            "perform",
            &json!({"observation": {"selector": "xpath=/html/body/button", "method": "click"}, "variables": {"user": "bob"}}),
        )
        .unwrap();
        assert!(matches!(call, BrowserToolCall::Perform { intent: PerformIntent::Observation(_), variables: Some(_) }));
    }

    #[test]
    fn test_session_create_is_not_selectable() {
        assert!(rejected("session_create", json!({})).contains("allow-list"));
        assert!(rejected("browserbase_session_create", json!({})).contains("allow-list"));
    }

    #[test]
    fn test_extract_requires_instruction() {
        assert!(rejected("extract", json!({})).contains("instruction"));
        assert!(rejected("extract", json!({"instruction": 3})).contains("string"));
    }

    #[test]
    fn test_navigate_validates_url() {
        assert!(rejected("navigate", json!({"url": "not a url"})).contains("valid URL"));
        assert!(rejected("navigate", json!({"url": "ftp://example.com"})).contains("http(s)"));
        let call = BrowserToolCall::from_proposal("navigate", &json!({"url": "https://example.com"})).unwrap();
        assert_eq!(call.remote_name(), remote::NAVIGATE);
        assert!(!call.appends_action());
    }

    #[test]
    fn test_unknown_arguments_rejected_but_flow_state_dropped() {
        assert!(rejected("screenshot", json!({"fullPage": true})).contains("fullPage"));
        let call = BrowserToolCall::from_proposal("get_url", &json!({"flowState": {"cacheKey": "x"}})).unwrap();
        assert_eq!(call, BrowserToolCall::GetUrl);
        assert!(call.arguments().is_empty());
    }

    #[test]
    fn test_observe_return_action_alias() {
        let call = BrowserToolCall::from_proposal(
            "observe",
            &json!({"instruction": "find the search box", "return_action": true}),
        )
        .unwrap();
        assert_eq!(call.arguments()["returnAction"], true);
    }

    #[test]
    fn test_replay_call_carries_only_replay_state() {
        let call = RemoteCall::Replay(FlowState::new("flow-1"));
        assert!(!call.carries_flow_state());
        assert_eq!(call.remote_name(), remote::ACT);
        let args = call.arguments();
        assert_eq!(args["replayState"]["cacheKey"], "flow-1");
        assert!(!args.contains_key("flowState"));
    }
}
