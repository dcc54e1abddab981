//! 运行主循环
//!
//! INIT（创建会话一次）-> PLANNING -> 校验 -> DISPATCHING -> MERGING -> ... -> 完成或失败。
//! FlowState 由本循环独占并逐步合并；任何终止路径都会尝试关闭远端会话。

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::state::ToolCallRecord;
use crate::core::{AgentError, EventEmitter, Execution, RecoveryAction, RecoveryEngine, RunStatus, StepRecord};
use crate::flow::FlowState;
use crate::mcp::ToolClient;
use crate::react::context::RunContext;
use crate::react::planner::{PlannerOutput, Planner};
use crate::react::FlowEvent;
use crate::tools::{BrowserToolCall, RemoteCall};

/// Step 事件中结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;
/// Planner 调用默认超时
pub const DEFAULT_PLANNER_TIMEOUT: Duration = Duration::from_secs(60);
/// 提示词中保留的最近步数默认值
pub const DEFAULT_HISTORY_WINDOW: usize = 6;

/// 运行会话配置
pub struct RunSession<'a> {
    pub planner: &'a Planner,
    pub client: &'a ToolClient,
    pub recovery: &'a RecoveryEngine,
    pub emitter: &'a EventEmitter,
    pub cancel_token: CancellationToken,
    pub history_window: usize,
    pub planner_timeout: Duration,
}

impl<'a> RunSession<'a> {
    pub fn new(
        planner: &'a Planner,
        client: &'a ToolClient,
        recovery: &'a RecoveryEngine,
        emitter: &'a EventEmitter,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            planner,
            client,
            recovery,
            emitter,
            cancel_token,
            history_window: DEFAULT_HISTORY_WINDOW,
            planner_timeout: DEFAULT_PLANNER_TIMEOUT,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn with_planner_timeout(mut self, planner_timeout: Duration) -> Self {
        self.planner_timeout = planner_timeout;
        self
    }
}

/// 一次运行的结果；error 为 None 表示进入等待确认
#[derive(Debug)]
pub struct RunOutcome {
    pub execution: Execution,
    pub flow_state: FlowState,
    pub summary: String,
    pub error: Option<AgentError>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// 在单步重试预算内执行 op；只有 RecoveryAction::Retry 会重试，其余错误原样返回
pub async fn with_retries<T, F, Fut>(
    recovery: &RecoveryEngine,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        match recovery.handle(&err, attempt) {
            RecoveryAction::Retry { backoff } => {
                tracing::warn!(
                    op = what,
                    attempt = attempt + 1,
                    budget = recovery.step_retry_budget(),
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                }
                attempt += 1;
            }
            _ => return Err(err),
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", text.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 执行一次任务，直到 Planner 结束、达到 max_steps、或出现不可恢复错误
pub async fn run_task(session: &RunSession<'_>, mut execution: Execution, mut flow: FlowState) -> RunOutcome {
    flow.ensure_cache_key();
    let mut session_open = flow.has_session();

    let result = drive(session, &mut execution, &mut flow, &mut session_open).await;

    if session_open {
        close_session(session, &flow).await;
    }

    match result {
        Ok(summary) => {
            if let Err(e) = execution.transition(RunStatus::CompletedAwaitingConfirmation) {
                tracing::warn!(error = %e, "status transition");
            }
            tracing::info!(
                cache_key = %flow.cache_key,
                steps = execution.steps.len(),
                actions = flow.actions.len(),
                "run completed"
            );
            RunOutcome { execution, flow_state: flow, summary, error: None }
        }
        Err(err) => {
            if let Err(e) = execution.transition(RunStatus::Failed) {
                tracing::warn!(error = %e, "status transition");
            }
            tracing::warn!(cache_key = %flow.cache_key, error = %err, "run failed");
            RunOutcome {
                execution,
                flow_state: flow,
                summary: format!("Run failed: {err}"),
                error: Some(err),
            }
        }
    }
}

async fn drive(
    session: &RunSession<'_>,
    execution: &mut Execution,
    flow: &mut FlowState,
    session_open: &mut bool,
) -> Result<String, AgentError> {
    let client = session.client;
    let cancel = &session.cancel_token;
    let max_steps = execution.max_steps;

    // INIT：未提供 sessionId 时创建一次会话
    if !flow.has_session() {
        let snapshot = flow.clone();
        let create = RemoteCall::SessionCreate;
        let (create_ref, snapshot_ref) = (&create, &snapshot);
        let created = with_retries(session.recovery, cancel, "session_create", move || {
            client.invoke(create_ref, snapshot_ref)
        })
        .await?;
        *session_open = true;
        let outcome = flow.merge(created.flow_state, false);
        if !outcome.session_established {
            tracing::warn!(cache_key = %flow.cache_key, "session_create returned no sessionId");
        }
    }

    let mut ctx = RunContext::new(execution.task_prompt.clone(), session.history_window);

    for step in 1..=max_steps {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        // PLANNING
        let planned = {
            let planner = session.planner;
            let planner_timeout = session.planner_timeout;
            let ctx_ref = &ctx;
            let flow_ref = &*flow;
            with_retries(session.recovery, cancel, "planner", move || async move {
                match timeout(planner_timeout, planner.plan(ctx_ref, flow_ref, step, max_steps)).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout("planner".to_string())),
                }
            })
            .await
        };
        let decision = match planned {
            Ok(d) => d,
            Err(e) => match session.recovery.handle(&e, 0) {
                RecoveryAction::RetryWithPrompt(feedback) => {
                    tracing::warn!(step, error = %e, "planner output rejected");
                    ctx.push_feedback(feedback);
                    continue;
                }
                _ => return Err(e),
            },
        };

        if !decision.reasoning.is_empty() {
            session.emitter.emit(FlowEvent::Reasoning { step, text: decision.reasoning.clone() });
        }

        let proposal = match decision.output {
            PlannerOutput::Finish { summary } => {
                let summary = if summary.trim().is_empty() {
                    "Task completed.".to_string()
                } else {
                    summary
                };
                return Ok(summary);
            }
            PlannerOutput::ToolCall(p) => p,
        };

        // 校验：违规不派发，作为纠错输入继续
        let call = match BrowserToolCall::from_proposal(&proposal.tool, &proposal.args) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(step, tool = %proposal.tool, error = %e, "proposal rejected");
                match session.recovery.handle(&e, 0) {
                    RecoveryAction::RetryWithPrompt(feedback) => ctx.push_feedback(feedback),
                    _ => ctx.push_feedback(e.to_string()),
                }
                continue;
            }
        };
        ctx.clear_feedback();

        // DISPATCHING
        let remote = RemoteCall::Tool(call.clone());
        let result = {
            let remote_ref = &remote;
            let flow_ref = &*flow;
            with_retries(session.recovery, cancel, call.remote_name(), move || {
                client.invoke(remote_ref, flow_ref)
            })
            .await?
        };

        // MERGING
        let merged = flow.merge(result.flow_state.clone(), call.appends_action());
        if let BrowserToolCall::Navigate { url } = &call {
            if flow.starting_url.is_none() {
                flow.starting_url = Some(url.clone());
            }
        }
        if matches!(call, BrowserToolCall::SessionClose) {
            *session_open = false;
        }
        tracing::debug!(
            step,
            tool = call.name(),
            source = ?result.flow_state_source,
            appended = merged.actions_appended,
            "merged flow state"
        );

        let args = Value::Object(call.arguments());
        ctx.set_screenshot(result.screenshot.clone());
        ctx.record_step(step, call.name(), &args, &result.content);

        execution.push_step(StepRecord {
            step,
            reasoning: decision.reasoning,
            tool_call: ToolCallRecord { tool: call.name().to_string(), args: args.clone() },
            tool_result: result.content.clone(),
            flow_state_snapshot: flow.clone(),
            screenshot: result.screenshot.clone(),
        });
        session.emitter.emit(FlowEvent::Step {
            step,
            max_steps,
            tool: call.name().to_string(),
            args,
            result: preview(&result.content),
            flow_state: flow.clone(),
            screenshot: result.screenshot,
        });
    }

    Ok(format!("Reached the step limit ({max_steps}) before the planner finished."))
}

/// 尽力关闭会话；失败只记录并上报，不影响运行结果
async fn close_session(session: &RunSession<'_>, flow: &FlowState) {
    let message = match session
        .client
        .invoke(&RemoteCall::Tool(BrowserToolCall::SessionClose), flow)
        .await
    {
        Ok(_) => "Browser session closed".to_string(),
        Err(e) => {
            tracing::warn!(cache_key = %flow.cache_key, error = %e, "session close failed");
            format!("Failed to close browser session: {e}")
        }
    };
    session.emitter.emit(FlowEvent::SessionClosed { message });
}
