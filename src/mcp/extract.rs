//! 远端响应归一化：FlowState / 截图 / 文本摘要
//!
//! 远端结果结构不固定，FlowState 可能出现在顶层字段、json 内容项、文本内容项中的嵌入 JSON
//! 或 message 文本里。提取按固定顺序逐个尝试，第一个命中者胜出；全部落空时调用方的 FlowState 保持不变。

use serde_json::{Map, Value};

use crate::flow::FlowStatePatch;

/// 截图最短长度（更短的视为占位或错误文本）
pub const MIN_SCREENSHOT_CHARS: usize = 100;
const SUMMARY_MAX_CHARS: usize = 800;
const RAW_FALLBACK_CHARS: usize = 500;
const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// FlowState 来自哪一级提取
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractSource {
    /// 顶层字段或 json 内容项
    Structured,
    /// 文本内容项或 message 中的嵌入 JSON
    EmbeddedText,
    /// 未找到，沿用调用方的 FlowState
    CallerFallback,
}

type Extractor = fn(&Map<String, Value>) -> Option<Value>;

const FLOW_STATE_CHAIN: &[(ExtractSource, Extractor)] = &[
    (ExtractSource::Structured, top_level_field),
    (ExtractSource::Structured, json_content_item),
    (ExtractSource::Structured, raw_field),
    (ExtractSource::EmbeddedText, text_content_item),
    (ExtractSource::EmbeddedText, message_field),
];

/// 提取 FlowState 片段；解析失败的候选跳过，继续下一级
pub fn extract_flow_state(result: &Value) -> (FlowStatePatch, ExtractSource) {
    let Some(map) = result.as_object() else {
        return (FlowStatePatch::default(), ExtractSource::CallerFallback);
    };
    for (source, extractor) in FLOW_STATE_CHAIN {
        if let Some(patch) = extractor(map).as_ref().and_then(FlowStatePatch::from_value) {
            if !patch.is_empty() {
                return (patch, *source);
            }
        }
    }
    (FlowStatePatch::default(), ExtractSource::CallerFallback)
}

fn object_member(map: &Map<String, Value>, key: &str) -> Option<Value> {
    map.get(key).filter(|v| v.is_object()).cloned()
}

fn top_level_field(map: &Map<String, Value>) -> Option<Value> {
    object_member(map, "flowState").or_else(|| object_member(map, "flow_state"))
}

fn content_items(map: &Map<String, Value>) -> impl Iterator<Item = &Map<String, Value>> {
    map.get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn json_content_item(map: &Map<String, Value>) -> Option<Value> {
    content_items(map).find_map(|item| {
        if item.get("type").and_then(Value::as_str) == Some("json") {
            item.get("json")
                .and_then(Value::as_object)
                .and_then(|inner| top_level_field(inner))
        } else if item.get("type").and_then(Value::as_str) != Some("text") {
            top_level_field(item)
        } else {
            None
        }
    })
}

fn raw_field(map: &Map<String, Value>) -> Option<Value> {
    map.get("raw").and_then(Value::as_object).and_then(top_level_field)
}

fn text_content_item(map: &Map<String, Value>) -> Option<Value> {
    content_items(map)
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .find_map(embedded_flow_state)
}

fn message_field(map: &Map<String, Value>) -> Option<Value> {
    map.get("message").and_then(Value::as_str).and_then(embedded_flow_state)
}

/// 在文本中寻找 FlowState：先找 `flowState` 之后的第一个完整对象，
/// 再退而求其次找任意带 cacheKey / browserbaseSessionId 的对象
fn embedded_flow_state(text: &str) -> Option<Value> {
    let lower = text.to_ascii_lowercase();
    for marker in ["flowstate", "flow_state"] {
        let mut from = 0;
        while let Some(pos) = lower[from..].find(marker) {
            let after = from + pos + marker.len();
            if let Some(open) = text[after..].find('{') {
                if let Some(obj) = balanced_object(&text[after + open..]) {
                    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(obj) {
                        return Some(unwrap_nested(value));
                    }
                }
            }
            from = after;
        }
    }
    text.match_indices('{').find_map(|(start, _)| {
        let obj = balanced_object(&text[start..])?;
        let value: Value = serde_json::from_str(obj).ok()?;
        let map = value.as_object()?;
        (map.contains_key("cacheKey") || map.contains_key("browserbaseSessionId")).then_some(value)
    })
}

/// `{"flowState": {...}}` 形式时取内层
fn unwrap_nested(value: Value) -> Value {
    match value.as_object().and_then(top_level_field) {
        Some(inner) => inner,
        None => value,
    }
}

/// 从 `{` 开始截取括号配平的对象，忽略字符串内的括号
pub fn balanced_object(text: &str) -> Option<&str> {
    if !text.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn screenshot_candidate(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_str))
        .find(|s| s.len() > MIN_SCREENSHOT_CHARS)
        .map(str::to_string)
}

fn to_data_url(data: String, mime: Option<&str>) -> String {
    if data.starts_with("data:") {
        data
    } else {
        match mime {
            Some(mime) if mime.starts_with("image/") => format!("data:{mime};base64,{data}"),
            _ => format!("{DATA_URL_PREFIX}{data}"),
        }
    }
}

/// 提取截图：image 内容项 -> 顶层 screenshot/image -> raw 下同名字段；统一为 data URL
pub fn extract_screenshot(result: &Value) -> Option<String> {
    let map = result.as_object()?;
    let from_content = content_items(map)
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("image"))
        .find_map(|item| {
            let data = screenshot_candidate(item, &["data", "image"])?;
            Some(to_data_url(data, item.get("mimeType").and_then(Value::as_str)))
        });
    from_content
        .or_else(|| screenshot_candidate(map, &["screenshot", "image"]).map(|d| to_data_url(d, None)))
        .or_else(|| {
            map.get("raw")
                .and_then(Value::as_object)
                .and_then(|raw| screenshot_candidate(raw, &["screenshot", "image"]))
                .map(|d| to_data_url(d, None))
        })
}

/// 结果中的全部文本：message 与 text 内容项
pub fn content_text(result: &Value) -> String {
    let Some(map) = result.as_object() else {
        return result.as_str().map(str::to_string).unwrap_or_default();
    };
    let mut chunks: Vec<&str> = Vec::new();
    if let Some(msg) = map.get("message").and_then(Value::as_str) {
        chunks.push(msg);
    }
    chunks.extend(
        content_items(map)
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str)),
    );
    chunks.join("\n")
}

/// 人类可读摘要：message、text 与 json 内容项依次拼接；皆无时取原始 JSON 前 500 字符；最多 800 字符
pub fn summarize_result(result: &Value) -> String {
    let Some(map) = result.as_object() else {
        return truncate_chars(&result.to_string(), SUMMARY_MAX_CHARS);
    };
    if map.is_empty() {
        return "Empty response".to_string();
    }
    let mut chunks: Vec<String> = Vec::new();
    if let Some(msg) = map.get("message").and_then(Value::as_str) {
        chunks.push(msg.trim().to_string());
    }
    for item in content_items(map) {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    chunks.push(text.trim().to_string());
                }
            }
            Some("json") => {
                if let Some(json) = item.get("json") {
                    chunks.push(json.to_string());
                }
            }
            _ => {}
        }
    }
    chunks.retain(|c| !c.is_empty());
    if chunks.is_empty() {
        chunks.push(truncate_chars(&result.to_string(), RAW_FALLBACK_CHARS));
    }
    truncate_chars(chunks.join(" ").trim(), SUMMARY_MAX_CHARS)
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
