//! 端到端场景：脚本化 Planner + 进程内假远端

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use flowpilot::config::AppConfig;
use flowpilot::core::{AgentError, Confirmation, Orchestrator, ReplayRequest, RunHandle, RunRequest, RunStatus};
use flowpilot::flow::{Action, FlowState, FlowStore, MemoryFlowStore};
use flowpilot::llm::ScriptedLlmClient;
use flowpilot::mcp::ToolTransport;
use flowpilot::react::FlowEvent;
use flowpilot::tools::remote;

type Handler = dyn Fn(&str, &Value, usize) -> Result<Value, AgentError> + Send + Sync;

/// 记录所有调用；handler 收到 (远端工具名, 参数, 该工具此前被调用的次数)
struct FakeTransport {
    calls: Mutex<Vec<(String, Value)>>,
    handler: Box<Handler>,
    /// 指定工具在返回前等待
    delay: Option<(&'static str, Duration)>,
}

impl FakeTransport {
    fn new(handler: impl Fn(&str, &Value, usize) -> Result<Value, AgentError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), handler: Box::new(handler), delay: None })
    }

    fn slow(tool: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(|name, _, _| Ok(standard_response(name))),
            delay: Some((tool, delay)),
        })
    }

    fn standard() -> Arc<Self> {
        Self::new(|name, _, _| Ok(standard_response(name)))
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|(n, _)| n == name).count()
    }
}

#[async_trait]
impl ToolTransport for FakeTransport {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AgentError> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            let seen = calls.iter().filter(|(n, _)| n == name).count();
            calls.push((name.to_string(), arguments.clone()));
            seen
        };
        if let Some((tool, delay)) = self.delay {
            if tool == name {
                tokio::time::sleep(delay).await;
            }
        }
        (self.handler)(name, &arguments, seen)
    }
}

fn screenshot_data() -> String {
    "iVBORw0KGgo".repeat(20)
}

fn standard_response(name: &str) -> Value {
    match name {
        remote::SESSION_CREATE => json!({
            "content": [{"type": "text", "text": "Session created"}],
            "flowState": {"browserbaseSessionId": "bb-session-1"}
        }),
        remote::NAVIGATE => json!({"content": [{"type": "text", "text": "Navigated"}]}),
        remote::SCREENSHOT => json!({"content": [{"type": "image", "data": screenshot_data(), "mimeType": "image/png"}]}),
        remote::ACT => json!({"content": [{"type": "text", "text": "Replayed all actions"}]}),
        _ => json!({"content": [{"type": "text", "text": "ok"}]}),
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.agent.retry_backoff_ms = 1;
    cfg.remote.request_timeout_secs = 5;
    cfg.llm.timeouts.request = 5;
    cfg
}

fn orchestrator(llm: Arc<ScriptedLlmClient>, transport: Arc<FakeTransport>) -> (Orchestrator, Arc<MemoryFlowStore>) {
    let store = Arc::new(MemoryFlowStore::new());
    let orch = Orchestrator::new(llm, transport, store.clone(), &test_config());
    (orch, store)
}

async fn collect(mut handle: RunHandle) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(ev) = handle.events.recv().await {
            events.push(ev);
        }
    })
    .await
    .expect("event stream did not close");
    events
}

fn final_event(events: &[FlowEvent]) -> (RunStatus, usize, FlowState) {
    events
        .iter()
        .find_map(|ev| match ev {
            FlowEvent::Final { status, total_steps, flow_state, .. } => Some((*status, *total_steps, flow_state.clone())),
            _ => None,
        })
        .expect("no final event")
}

fn recorded_flow(key: &str, n: usize) -> FlowState {
    FlowState {
        cache_key: key.to_string(),
        starting_url: Some("https://example.com".into()),
        session_id: Some("bb-old".into()),
        actions: (0..n).map(|i| Action::action(format!("step {}", i + 1), i as i64)).collect(),
    }
}

#[tokio::test]
async fn test_navigate_screenshot_finish_run() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning": "open the site", "tool": "navigate", "args": {"url": "https://example.com"}}"#,
        r#"{"reasoning": "check the page", "tool": "screenshot", "args": {}}"#,
        r#"{"reasoning": "done", "finish": true, "summary": "Opened example.com"}"#,
    ]));
    let transport = FakeTransport::standard();
    let (orch, store) = orchestrator(llm.clone(), transport.clone());

    let handle = orch.submit_run(RunRequest::new("Open example.com")).await.unwrap();
    let key = handle.cache_key.clone();
    let events = collect(handle).await;

    let (status, total_steps, flow) = final_event(&events);
    assert_eq!(status, RunStatus::CompletedAwaitingConfirmation);
    assert!(total_steps <= 5);
    assert_eq!(total_steps, 2);
    assert_eq!(flow.starting_url.as_deref(), Some("https://example.com"));
    assert_eq!(flow.session_id.as_deref(), Some("bb-session-1"));
    assert_eq!(flow.cache_key, key);

    assert_eq!(transport.count(remote::SESSION_CREATE), 1);
    assert_eq!(transport.count(remote::SESSION_CLOSE), 1);
    assert_eq!(transport.calls()[0].0, remote::SESSION_CREATE);

    match events.last() {
        Some(FlowEvent::ConfirmationRequired { cache_key, message }) => {
            assert_eq!(cache_key, &key);
            assert!(message.contains("replay"));
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert!(events.iter().any(|e| matches!(e, FlowEvent::SessionClosed { .. })));

    // 截图之后的那一轮提示词附带了截图说明
    assert!(llm.prompts()[2].contains("screenshot"));

    assert!(store.get(&key).await.unwrap().is_some());
    assert_eq!(orch.pending_confirmations().await, vec![key.clone()]);
    let flows = orch.list_flows(10).await.unwrap();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].cache_key, key);
    let executions = orch.list_executions(10).await.unwrap();
    assert_eq!(executions[0].status, "completed");

    match orch.confirm(&key, false).await.unwrap() {
        Confirmation::Cleared { cache_key } => assert_eq!(cache_key, key),
        Confirmation::Replay(_) => panic!("expected cleared"),
    }
    assert!(store.get(&key).await.unwrap().is_none());
    assert!(store.list_executions(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replay_emits_ordered_actions_and_single_completion() {
    let transport = FakeTransport::standard();
    let (orch, store) = orchestrator(Arc::new(ScriptedLlmClient::default()), transport.clone());
    let flow = recorded_flow("flow-replay", 3);
    store.put("flow-replay", "three clicks", &flow).await.unwrap();

    let handle = orch
        .submit_replay(ReplayRequest { cache_key: Some("flow-replay".into()), flow_state: None })
        .await
        .unwrap();
    let events = collect(handle).await;

    assert!(matches!(events.first(), Some(FlowEvent::ReplayStart { .. })));
    let actions: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::ReplayAction { action_index, total_actions, .. } => Some((*action_index, *total_actions)),
            _ => None,
        })
        .collect();
    assert_eq!(actions, vec![(1, 3), (2, 3), (3, 3)]);

    let completions = events.iter().filter(|e| matches!(e, FlowEvent::ReplayComplete { .. })).count();
    assert_eq!(completions, 1);
    assert!(matches!(events.last(), Some(FlowEvent::ReplayComplete { .. })));
    let screenshots = events.iter().filter(|e| matches!(e, FlowEvent::ReplayScreenshot { .. })).count();
    assert_eq!(screenshots, 2);

    let acts: Vec<Value> = transport
        .calls()
        .into_iter()
        .filter(|(n, _)| n == remote::ACT)
        .map(|(_, args)| args)
        .collect();
    assert_eq!(acts.len(), 1);
    assert!(acts[0].get("flowState").is_none());
    assert_eq!(acts[0]["replayState"]["actions"].as_array().unwrap().len(), 3);
    assert_eq!(transport.count(remote::SESSION_CREATE), 0);

    assert!(store.get("flow-replay").await.unwrap().is_none());
}

#[tokio::test]
async fn test_perform_without_intent_never_dispatched() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning": "click something", "tool": "perform", "args": {}}"#,
        r#"{"reasoning": "give up", "finish": true, "summary": "nothing to do"}"#,
    ]));
    let transport = FakeTransport::standard();
    let (orch, _) = orchestrator(llm.clone(), transport.clone());

    let events = collect(orch.submit_run(RunRequest::new("Click the button")).await.unwrap()).await;

    assert_eq!(transport.count(remote::ACT), 0);
    let (status, total_steps, _) = final_event(&events);
    assert_eq!(status, RunStatus::CompletedAwaitingConfirmation);
    assert_eq!(total_steps, 0);

    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("rejected"));
    assert!(prompts[1].contains("rejected"));
    assert!(prompts[1].contains("got neither"));
}

#[tokio::test]
async fn test_self_healing_reported_in_replay_summary() {
    let transport = FakeTransport::new(|name, _, _| {
        if name == remote::ACT {
            Ok(json!({"content": [{"type": "text", "text": "Action 1 ok\nAction 2 self-healed: selector changed, used a new locator\nAction 3 ok"}]}))
        } else {
            Ok(standard_response(name))
        }
    });
    let (orch, _) = orchestrator(Arc::new(ScriptedLlmClient::default()), transport);

    let handle = orch
        .submit_replay(ReplayRequest { cache_key: None, flow_state: Some(recorded_flow("flow-heal", 3)) })
        .await
        .unwrap();
    let events = collect(handle).await;

    match events.last() {
        Some(FlowEvent::ReplayComplete { summary, self_healed, cache_key, .. }) => {
            assert!(*self_healed >= 1);
            assert!(summary.starts_with("[self-healed: 1]"), "{summary}");
            assert_eq!(cache_key, "flow-heal");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[tokio::test]
async fn test_only_perform_grows_actions() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning": "go", "tool": "navigate", "args": {"url": "https://example.com/login"}}"#,
        r#"{"reasoning": "log in", "tool": "perform", "args": {"action": "click the login button"}}"#,
        r#"{"reasoning": "done", "finish": true, "summary": "logged in"}"#,
    ]));
    let transport = FakeTransport::new(|name, args, _| match name {
        // 非 perform 工具返回的 actions 必须被忽略
        remote::NAVIGATE => Ok(json!({
            "content": [{"type": "text", "text": "Navigated"}],
            "flowState": {"actions": [{"type": "action", "data": "bogus", "timestamp": 1}]}
        })),
        remote::ACT => {
            let mut state = args["flowState"].clone();
            state["actions"] = json!([{"type": "action", "data": "click the login button", "timestamp": 2}]);
            state["cacheKey"] = json!("some-other-key");
            Ok(json!({"content": [{"type": "text", "text": "Clicked"}], "flowState": state}))
        }
        other => Ok(standard_response(other)),
    });
    let (orch, _) = orchestrator(llm, transport);

    let handle = orch.submit_run(RunRequest::new("Log in")).await.unwrap();
    let key = handle.cache_key.clone();
    let events = collect(handle).await;

    let step_actions: Vec<(String, usize)> = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::Step { tool, flow_state, .. } => Some((tool.clone(), flow_state.actions.len())),
            _ => None,
        })
        .collect();
    assert_eq!(step_actions, vec![("navigate".to_string(), 0), ("perform".to_string(), 1)]);

    let (_, _, flow) = final_event(&events);
    assert_eq!(flow.cache_key, key);
    assert_eq!(flow.starting_url.as_deref(), Some("https://example.com/login"));
}

#[tokio::test]
async fn test_replay_of_empty_flow_makes_no_calls() {
    let transport = FakeTransport::standard();
    let (orch, _) = orchestrator(Arc::new(ScriptedLlmClient::default()), transport.clone());

    let err = orch
        .submit_replay(ReplayRequest { cache_key: None, flow_state: Some(FlowState::new("flow-empty")) })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Precondition(_)));

    let err = orch
        .submit_replay(ReplayRequest { cache_key: Some("missing".into()), flow_state: None })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Precondition(_)));
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_transport_errors_retried_within_budget() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning": "go", "tool": "navigate", "args": {"url": "https://example.com"}}"#,
    ]));
    let transport = FakeTransport::new(|name, _, seen| {
        if name == remote::NAVIGATE && seen < 2 {
            Err(AgentError::Transport("connection reset".into()))
        } else {
            Ok(standard_response(name))
        }
    });
    let (orch, _) = orchestrator(llm, transport.clone());

    let events = collect(orch.submit_run(RunRequest::new("Open example.com")).await.unwrap()).await;
    let (status, total_steps, _) = final_event(&events);
    assert_eq!(status, RunStatus::CompletedAwaitingConfirmation);
    assert_eq!(total_steps, 1);
    assert_eq!(transport.count(remote::NAVIGATE), 3);
}

#[tokio::test]
async fn test_exhausted_budget_fails_and_still_closes_session() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning": "go", "tool": "navigate", "args": {"url": "https://example.com"}}"#,
    ]));
    let transport = FakeTransport::new(|name, _, _| {
        if name == remote::NAVIGATE {
            Err(AgentError::Transport("HTTP 502".into()))
        } else {
            Ok(standard_response(name))
        }
    });
    let (orch, store) = orchestrator(llm, transport.clone());

    let handle = orch.submit_run(RunRequest::new("Open example.com")).await.unwrap();
    let key = handle.cache_key.clone();
    let events = collect(handle).await;

    let (status, _, _) = final_event(&events);
    assert_eq!(status, RunStatus::Failed);
    match events.last() {
        Some(FlowEvent::Error { kind, .. }) => assert_eq!(kind, "transport"),
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert_eq!(transport.count(remote::NAVIGATE), 3);
    assert_eq!(transport.count(remote::SESSION_CLOSE), 1);
    assert!(store.get(&key).await.unwrap().is_none());
    assert_eq!(store.list_executions(5).await.unwrap()[0].status, "failed");
}

#[tokio::test]
async fn test_rejects_invalid_requests_and_keys_in_use() {
    let (orch, _) = orchestrator(Arc::new(ScriptedLlmClient::default()), FakeTransport::standard());

    assert!(matches!(
        orch.submit_run(RunRequest::new("   ")).await,
        Err(AgentError::InvalidRequest(_))
    ));
    let mut zero = RunRequest::new("do it");
    zero.max_steps = Some(0);
    assert!(matches!(orch.submit_run(zero).await, Err(AgentError::InvalidRequest(_))));

    // 等待确认的运行仍占用其 cacheKey
    let mut first = RunRequest::new("first");
    first.cache_key = Some("flow-shared".into());
    collect(orch.submit_run(first).await.unwrap()).await;

    let mut second = RunRequest::new("second");
    second.cache_key = Some("flow-shared".into());
    assert!(matches!(orch.submit_run(second).await, Err(AgentError::SessionInUse(_))));

    let cleared = orch.clear().await.unwrap();
    assert_eq!(cleared.status, "success");
    assert_eq!(cleared.message, "All local state data cleared. Ready for new tasks.");
    assert!(orch.pending_confirmations().await.is_empty());

    let mut third = RunRequest::new("third");
    third.cache_key = Some("flow-shared".into());
    assert!(orch.submit_run(third).await.is_ok());
}

#[tokio::test]
async fn test_approved_confirmation_replays_recorded_actions() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning": "click", "tool": "perform", "args": {"observation": {"selector": "xpath=/html/body/a", "description": "Docs link", "method": "click"}}}"#,
        r#"{"reasoning": "done", "finish": true, "summary": "opened docs"}"#,
    ]));
    let transport = FakeTransport::new(|name, args, _| {
        if name == remote::ACT && args.get("observation").is_some() {
            let mut state = args["flowState"].clone();
            state["actions"] = json!([{"type": "observation", "data": args["observation"].clone(), "timestamp": 5}]);
            Ok(json!({"content": [{"type": "text", "text": "Clicked"}], "flowState": state}))
        } else {
            Ok(standard_response(name))
        }
    });
    let (orch, store) = orchestrator(llm, transport.clone());

    let handle = orch.submit_run(RunRequest::new("Open the docs")).await.unwrap();
    let key = handle.cache_key.clone();
    collect(handle).await;

    let replay = match orch.confirm(&key, true).await.unwrap() {
        Confirmation::Replay(handle) => handle,
        Confirmation::Cleared { .. } => panic!("expected replay"),
    };
    let events = collect(replay).await;
    let descriptions: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::ReplayAction { description, .. } => Some(description.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(descriptions, vec!["Docs link".to_string()]);
    assert!(matches!(events.last(), Some(FlowEvent::ReplayComplete { .. })));
    assert!(store.get(&key).await.unwrap().is_none());
    assert!(orch.pending_confirmations().await.is_empty());
}

#[tokio::test]
async fn test_cancelled_run_still_closes_session() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning": "go", "tool": "navigate", "args": {"url": "https://example.com"}}"#,
        r#"{"reasoning": "again", "tool": "navigate", "args": {"url": "https://example.com/next"}}"#,
    ]));
    let transport = FakeTransport::slow(remote::NAVIGATE, Duration::from_millis(500));
    let (orch, store) = orchestrator(llm, transport.clone());

    let handle = orch.submit_run(RunRequest::new("Open example.com")).await.unwrap();
    let key = handle.cache_key.clone();
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let events = collect(handle).await;

    let (status, _, _) = final_event(&events);
    assert_eq!(status, RunStatus::Failed);
    match events.last() {
        Some(FlowEvent::Error { kind, .. }) => assert_eq!(kind, "cancelled"),
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert_eq!(transport.count(remote::NAVIGATE), 1);
    assert_eq!(transport.count(remote::SESSION_CLOSE), 1);
    assert!(events.iter().any(|e| matches!(e, FlowEvent::SessionClosed { .. })));
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_replay_still_closes_session() {
    let transport = FakeTransport::slow(remote::ACT, Duration::from_secs(3));
    let (orch, store) = orchestrator(Arc::new(ScriptedLlmClient::default()), transport.clone());
    store.put("flow-cancel", "two clicks", &recorded_flow("flow-cancel", 2)).await.unwrap();

    let handle = orch
        .submit_replay(ReplayRequest { cache_key: Some("flow-cancel".into()), flow_state: None })
        .await
        .unwrap();
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });
    let started = std::time::Instant::now();
    let events = collect(handle).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    match events.last() {
        Some(FlowEvent::Error { kind, .. }) => assert_eq!(kind, "cancelled"),
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e, FlowEvent::ReplayComplete { .. })));
    assert_eq!(transport.count(remote::ACT), 1);
    assert_eq!(transport.count(remote::SESSION_CLOSE), 1);
    // 未完成的回放保留已录制的流程
    assert!(store.get("flow-cancel").await.unwrap().is_some());
}

#[tokio::test]
async fn test_replay_screenshot_failure_degrades_to_no_image() {
    let transport = FakeTransport::new(|name, _, _| {
        if name == remote::SCREENSHOT {
            Err(AgentError::Transport("screenshot service unavailable".into()))
        } else {
            Ok(standard_response(name))
        }
    });
    let (orch, _) = orchestrator(Arc::new(ScriptedLlmClient::default()), transport.clone());

    let handle = orch
        .submit_replay(ReplayRequest { cache_key: None, flow_state: Some(recorded_flow("flow-noshot", 2)) })
        .await
        .unwrap();
    let events = collect(handle).await;

    assert!(!events.iter().any(|e| matches!(e, FlowEvent::ReplayScreenshot { .. })));
    assert!(matches!(events.last(), Some(FlowEvent::ReplayComplete { .. })));
    assert_eq!(transport.count(remote::SCREENSHOT), 2);
    assert_eq!(transport.count(remote::SESSION_CLOSE), 1);
}

#[tokio::test]
async fn test_malformed_response_retried_within_budget() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning": "go", "tool": "navigate", "args": {"url": "https://example.com"}}"#,
    ]));
    let transport = FakeTransport::new(|name, _, seen| {
        if name == remote::NAVIGATE && seen == 0 {
            Ok(json!("not a tool result"))
        } else {
            Ok(standard_response(name))
        }
    });
    let (orch, _) = orchestrator(llm, transport.clone());

    let events = collect(orch.submit_run(RunRequest::new("Open example.com")).await.unwrap()).await;
    let (status, total_steps, flow) = final_event(&events);
    assert_eq!(status, RunStatus::CompletedAwaitingConfirmation);
    assert_eq!(total_steps, 1);
    assert_eq!(flow.starting_url.as_deref(), Some("https://example.com"));
    assert_eq!(transport.count(remote::NAVIGATE), 2);
}

#[tokio::test]
async fn test_replay_rejected_while_session_owned_by_another_replay() {
    let transport = FakeTransport::slow(remote::ACT, Duration::from_millis(500));
    let (orch, _) = orchestrator(Arc::new(ScriptedLlmClient::default()), transport);

    let first = orch
        .submit_replay(ReplayRequest { cache_key: None, flow_state: Some(recorded_flow("flow-a", 1)) })
        .await
        .unwrap();
    // 不同 cacheKey，同一 browserbaseSessionId
    let second = orch
        .submit_replay(ReplayRequest { cache_key: None, flow_state: Some(recorded_flow("flow-b", 1)) })
        .await;
    assert!(matches!(second, Err(AgentError::SessionInUse(_))));

    let events = collect(first).await;
    assert!(matches!(events.last(), Some(FlowEvent::ReplayComplete { .. })));
    assert!(orch
        .submit_replay(ReplayRequest { cache_key: None, flow_state: Some(recorded_flow("flow-b", 1)) })
        .await
        .is_ok());
}
