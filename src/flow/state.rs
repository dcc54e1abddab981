//! FlowState：一次运行的可移植快照（cacheKey / startingUrl / sessionId / actions）
//!
//! 远端工具面是无状态的，所有会话身份与动作历史都靠 FlowState 在每次调用间传递。
//! 远端响应可能只带部分字段，因此响应侧使用 FlowStatePatch（字段全部可选），
//! 再由 FlowState::merge 按字段级策略合并：出现的字段覆盖，缺失的字段保留。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 动作类型：observation 带确定性定位器，action 只带自然语言意图
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Observation,
    Action,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Observation => "observation",
            ActionKind::Action => "action",
        }
    }
}

/// 动作数据：结构化定位器对象（selector / description / method / arguments）或自然语言文本
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionData {
    Text(String),
    Locator(Map<String, Value>),
}

/// 单条录制动作
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub data: ActionData,
    /// 毫秒时间戳
    #[serde(default)]
    pub timestamp: i64,
}

impl Action {
    pub fn observation(locator: Map<String, Value>, timestamp: i64) -> Self {
        Self {
            kind: ActionKind::Observation,
            data: ActionData::Locator(locator),
            timestamp,
        }
    }

    pub fn action(intent: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: ActionKind::Action,
            data: ActionData::Text(intent.into()),
            timestamp,
        }
    }

    /// 人类可读描述：定位器的 description / action 字段，或文本本身；都没有时为 "Action N"（N 从 1 开始）
    pub fn describe(&self, index: usize) -> String {
        let described = match &self.data {
            ActionData::Locator(map) => ["description", "action"]
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
                .map(str::to_string),
            ActionData::Text(text) if !text.trim().is_empty() => Some(text.clone()),
            ActionData::Text(_) => None,
        };
        described.unwrap_or_else(|| format!("Action {}", index + 1))
    }
}

/// 生成新的 cacheKey：flow-<uuid>
pub fn generate_cache_key() -> String {
    format!("flow-{}", Uuid::new_v4().simple())
}

/// 运行的 FlowState（线上格式为 camelCase）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    #[serde(default)]
    pub cache_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_url: Option<String>,
    #[serde(
        default,
        alias = "browserbaseSessionId",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// 远端响应中提取出的 FlowState 片段；None 表示响应未携带该字段
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatePatch {
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub starting_url: Option<String>,
    #[serde(default, alias = "browserbaseSessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub actions: Option<Vec<Action>>,
}

impl FlowStatePatch {
    /// 从 JSON 对象解析；非对象或字段类型不符时返回 None
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.cache_key.is_none()
            && self.starting_url.is_none()
            && self.session_id.is_none()
            && self.actions.is_none()
    }
}

impl From<FlowState> for FlowStatePatch {
    fn from(state: FlowState) -> Self {
        Self {
            cache_key: Some(state.cache_key).filter(|k| !k.is_empty()),
            starting_url: state.starting_url,
            session_id: state.session_id,
            actions: Some(state.actions),
        }
    }
}

/// 单次合并的结果，用于日志与测试断言
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub actions_appended: usize,
    pub session_established: bool,
    /// 被拒绝的字段（如试图改写 cacheKey、缩短 actions）
    pub rejected: Vec<&'static str>,
}

impl FlowState {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            ..Self::default()
        }
    }

    /// cacheKey 缺失时生成一个；已设置的 cacheKey 不会被改写
    pub fn ensure_cache_key(&mut self) -> &str {
        if self.cache_key.is_empty() {
            self.cache_key = generate_cache_key();
        }
        &self.cache_key
    }

    pub fn has_session(&self) -> bool {
        self.session_id.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// 字段级合并：
    /// - cacheKey 仅在当前为空时写入，之后不可变
    /// - startingUrl 后写覆盖
    /// - sessionId 每次运行至多建立一次，不会被不同的值替换
    /// - actions 仅在 `allow_actions`（perform 工具）时接受，且长度不得减少
    pub fn merge(&mut self, patch: FlowStatePatch, allow_actions: bool) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        if let Some(key) = patch.cache_key.filter(|k| !k.is_empty()) {
            if self.cache_key.is_empty() {
                self.cache_key = key;
            } else if self.cache_key != key {
                outcome.rejected.push("cacheKey");
            }
        }

        if let Some(url) = patch.starting_url.filter(|u| !u.is_empty()) {
            self.starting_url = Some(url);
        }

        if let Some(session) = patch.session_id.filter(|s| !s.is_empty()) {
            match &self.session_id {
                None => {
                    self.session_id = Some(session);
                    outcome.session_established = true;
                }
                Some(current) if *current != session => outcome.rejected.push("sessionId"),
                Some(_) => {}
            }
        }

        if let Some(actions) = patch.actions {
            if !allow_actions {
                if actions.len() != self.actions.len() {
                    outcome.rejected.push("actions");
                }
            } else if actions.len() < self.actions.len() {
                outcome.rejected.push("actions");
            } else {
                outcome.actions_appended = actions.len() - self.actions.len();
                self.actions = actions;
            }
        }

        if !outcome.rejected.is_empty() {
            tracing::warn!(
                cache_key = %self.cache_key,
                rejected = ?outcome.rejected,
                "FlowState merge ignored conflicting fields"
            );
        }
        outcome
    }

    /// 简短描述，拼入 Planner 提示词
    pub fn describe(&self) -> String {
        format!(
            "cacheKey={}, startingUrl={}, actions={}, session={}",
            self.cache_key,
            self.starting_url.as_deref().unwrap_or("unknown"),
            self.actions.len(),
            if self.has_session() { "yes" } else { "no" }
        )
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
