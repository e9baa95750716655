//! Submit-and-process: drive one run to a terminal state.

use std::time::Duration;

use crate::approval::{ApprovalDecision, ApprovalPolicy, ToolApproval, ToolCallRequest};
use crate::error::ProcessingError;
use crate::session::{FunctionCall, RequiredAction, Run, RunStatus, Session, SessionStore, ToolOutput};
use crate::tools::{ToolEntry, ToolRegistry};

use super::TurnState;

/// Polling and deadline settings for a run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub poll_interval: Duration,
    /// Bound on the whole run, approvals and tool execution included
    pub run_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            run_timeout: Duration::from_secs(300),
        }
    }
}

/// Everything a run needs besides the session itself.
pub struct RunContext<'a> {
    pub store: &'a dyn SessionStore,
    pub registry: &'a ToolRegistry,
    pub policy: &'a dyn ApprovalPolicy,
    pub options: RunOptions,
}

/// Start a run on `session` and resolve every action it requires until it ends.
///
/// Approval requests go through the policy one at a time; function calls are
/// executed from the registry. `on_state` observes `Processing` and
/// `AwaitingApproval` transitions. A run still going after
/// `options.run_timeout` is cancelled.
pub async fn process_run(
    ctx: &RunContext<'_>,
    session: &Session,
    on_state: &mut (dyn FnMut(TurnState) + Send),
) -> Result<Run, ProcessingError> {
    let run = ctx.store.create_run(session).await?;
    let run_id = run.id.clone();
    on_state(TurnState::Processing);
    tracing::debug!(run_id = %run.id, status = %run.status, "Run created");

    let run = match tokio::time::timeout(
        ctx.options.run_timeout,
        drive(ctx, session, run, on_state),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            tracing::warn!(run_id = %run_id, "Run exceeded {:?}, cancelling", ctx.options.run_timeout);
            if let Err(e) = ctx.store.cancel_run(session, &run_id).await {
                tracing::warn!(run_id = %run_id, "Failed to cancel run: {}", e);
            }
            return Err(ProcessingError::RunTimeout {
                run_id,
                timeout: ctx.options.run_timeout,
            });
        }
    };

    match run.status {
        RunStatus::Completed => Ok(run),
        status => Err(ProcessingError::RunFailed {
            run_id: run.id,
            status: status.to_string(),
            message: run
                .last_error
                .unwrap_or_else(|| "no error reported".to_string()),
        }),
    }
}

async fn drive(
    ctx: &RunContext<'_>,
    session: &Session,
    mut run: Run,
    on_state: &mut (dyn FnMut(TurnState) + Send),
) -> Result<Run, ProcessingError> {
    while !run.status.is_terminal() {
        match (run.status, run.required_action.take()) {
            (RunStatus::RequiresAction, Some(RequiredAction::SubmitToolApproval(requests))) => {
                on_state(TurnState::AwaitingApproval);
                let approvals = resolve_approvals(ctx.registry, ctx.policy, &requests).await;
                run = ctx
                    .store
                    .submit_tool_outputs(session, &run.id, Vec::new(), approvals)
                    .await?;
                on_state(TurnState::Processing);
            }
            (RunStatus::RequiresAction, Some(RequiredAction::SubmitToolOutputs(calls))) => {
                let outputs = execute_functions(ctx.registry, &calls).await;
                run = ctx
                    .store
                    .submit_tool_outputs(session, &run.id, outputs, Vec::new())
                    .await?;
            }
            _ => {
                tokio::time::sleep(ctx.options.poll_interval).await;
                run = ctx.store.get_run(session, &run.id).await?;
            }
        }
        tracing::debug!(run_id = %run.id, status = %run.status, "Run status");
    }
    Ok(run)
}

/// One decision per request, in order. Requests that do not need approval,
/// or that target an MCP server registered to auto-execute, are approved
/// without consulting the policy.
async fn resolve_approvals(
    registry: &ToolRegistry,
    policy: &dyn ApprovalPolicy,
    requests: &[ToolCallRequest],
) -> Vec<ToolApproval> {
    let mut approvals = Vec::with_capacity(requests.len());
    for request in requests {
        let auto_execute = matches!(
            registry.lookup(&request.server_label),
            Ok(entry @ ToolEntry::Mcp(_)) if entry.auto_execute()
        );
        let decision = if !request.requires_approval {
            ApprovalDecision::approve()
        } else if auto_execute {
            tracing::info!(
                server = %request.server_label,
                tool = %request.name,
                "Server is registered to auto-execute, skipping approval"
            );
            ApprovalDecision::approve()
        } else {
            policy.decide(request).await
        };
        tracing::info!(
            tool_call_id = %request.id,
            tool = %request.name,
            approved = decision.is_approved(),
            "Resolved tool call"
        );
        approvals.push(ToolApproval {
            tool_call_id: request.id.clone(),
            decision,
        });
    }
    approvals
}

/// Run the requested function tools. Failures become the tool's output so the
/// agent can react to them instead of the turn failing.
async fn execute_functions(registry: &ToolRegistry, calls: &[FunctionCall]) -> Vec<ToolOutput> {
    let mut outputs = Vec::with_capacity(calls.len());
    for call in calls {
        let args: serde_json::Value =
            serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null);
        tracing::info!("Calling tool: {} with args: {}", call.name, call.arguments);

        let output = match registry.execute(&call.name, args).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = %call.name, "Tool failed: {}", e);
                format!("Error: {}", e)
            }
        };
        outputs.push(ToolOutput {
            tool_call_id: call.id.clone(),
            output,
        });
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::approval::{ApproveAll, DenyAll};
    use crate::session::{AgentConfig, InMemorySessionStore, PlannedCall, Role};
    use crate::tools::{CalculatePizzaForPeople, McpApprovalMode, McpTool};

    /// Counts decisions and delegates to another policy.
    struct Counting<P> {
        inner: P,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl<P: ApprovalPolicy> ApprovalPolicy for Counting<P> {
        async fn decide(&self, request: &ToolCallRequest) -> ApprovalDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.decide(request).await
        }
    }

    fn registry(mode: McpApprovalMode) -> ToolRegistry {
        let mut mcp = McpTool::new("contoso_pizza", "https://mcp.example.com/sse", vec![]);
        mcp.set_approval_mode(mode);
        let mut registry = ToolRegistry::new();
        registry.register(CalculatePizzaForPeople).unwrap();
        registry.register(mcp).unwrap();
        registry
    }

    async fn session_with_plan(
        store: &InMemorySessionStore,
        registry: &ToolRegistry,
        plan: Vec<PlannedCall>,
    ) -> Session {
        store.set_plan(plan).await;
        let session = store
            .create_session(&AgentConfig {
                model: "gpt-4o".to_string(),
                name: "test".to_string(),
                instructions: String::new(),
                temperature: 0.7,
                top_p: 0.7,
                tools: registry.definitions(),
                tool_resources: registry.tool_resources(),
            })
            .await
            .unwrap();
        store
            .append_turn(&session, Role::User, "order pizza")
            .await
            .unwrap();
        session
    }

    fn order_call() -> PlannedCall {
        PlannedCall::Mcp {
            server_label: "contoso_pizza".to_string(),
            name: "place_order".to_string(),
            arguments: "{\"size\":\"large\"}".to_string(),
        }
    }

    async fn reply(store: &InMemorySessionStore, session: &Session) -> String {
        store.list_turns(session).await.unwrap()[0]
            .text()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn approval_required_calls_are_decided_once() {
        let store = InMemorySessionStore::new();
        let registry = registry(McpApprovalMode::Always);
        let session = session_with_plan(&store, &registry, vec![order_call(), order_call()]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = Counting {
            inner: ApproveAll::from_registry(&registry),
            calls: calls.clone(),
        };
        let ctx = RunContext {
            store: &store,
            registry: &registry,
            policy: &policy,
            options: RunOptions::default(),
        };

        let mut states = Vec::new();
        let run = process_run(&ctx, &session, &mut |s| states.push(s))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            states,
            vec![
                TurnState::Processing,
                TurnState::AwaitingApproval,
                TurnState::Processing
            ]
        );
    }

    #[tokio::test]
    async fn auto_execute_calls_bypass_the_policy() {
        let store = InMemorySessionStore::new();
        let registry = registry(McpApprovalMode::Never);
        let session = session_with_plan(&store, &registry, vec![order_call()]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = Counting {
            inner: ApproveAll::new(),
            calls: calls.clone(),
        };
        let ctx = RunContext {
            store: &store,
            registry: &registry,
            policy: &policy,
            options: RunOptions::default(),
        };

        process_run(&ctx, &session, &mut |_| {}).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(reply(&store, &session).await.contains("ran without approval"));
    }

    #[tokio::test]
    async fn auto_execute_servers_skip_the_policy_even_when_asked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = Counting {
            inner: DenyAll,
            calls: calls.clone(),
        };
        let request = |server_label: &str| ToolCallRequest {
            id: format!("call_{}", server_label),
            name: "place_order".to_string(),
            server_label: server_label.to_string(),
            arguments: "{}".to_string(),
            requires_approval: true,
        };
        let requests = vec![request("contoso_pizza"), request("unregistered")];

        let never = registry(McpApprovalMode::Never);
        let approvals = resolve_approvals(&never, &policy, &requests).await;
        assert!(approvals[0].decision.is_approved());
        assert!(!approvals[1].decision.is_approved());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let always = registry(McpApprovalMode::Always);
        let approvals = resolve_approvals(&always, &policy, &requests).await;
        assert!(!approvals[0].decision.is_approved());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn denial_completes_with_distinct_reply() {
        let store = InMemorySessionStore::new();
        let registry = registry(McpApprovalMode::Always);

        let approved = session_with_plan(&store, &registry, vec![order_call()]).await;
        let policy = ApproveAll::new();
        let ctx = RunContext {
            store: &store,
            registry: &registry,
            policy: &policy,
            options: RunOptions::default(),
        };
        process_run(&ctx, &approved, &mut |_| {}).await.unwrap();

        let denied = session_with_plan(&store, &registry, vec![order_call()]).await;
        let ctx = RunContext {
            policy: &DenyAll,
            ..ctx
        };
        let run = process_run(&ctx, &denied, &mut |_| {}).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let approved_reply = reply(&store, &approved).await;
        let denied_reply = reply(&store, &denied).await;
        assert!(approved_reply.contains("place_order approved"));
        assert!(denied_reply.contains("place_order was declined"));
        assert_ne!(approved_reply, denied_reply);
    }

    #[tokio::test]
    async fn function_calls_are_executed_locally() {
        let store = InMemorySessionStore::new();
        let registry = registry(McpApprovalMode::Always);
        let session = session_with_plan(
            &store,
            &registry,
            vec![
                PlannedCall::Function {
                    name: "calculate_pizza_for_people".to_string(),
                    arguments: "{\"people_count\":4}".to_string(),
                },
                PlannedCall::Function {
                    name: "unknown_tool".to_string(),
                    arguments: "{}".to_string(),
                },
            ],
        )
        .await;
        let ctx = RunContext {
            store: &store,
            registry: &registry,
            policy: &DenyAll,
            options: RunOptions::default(),
        };

        process_run(&ctx, &session, &mut |_| {}).await.unwrap();

        let text = reply(&store, &session).await;
        assert!(text.contains("calculate_pizza_for_people returned: For 4 people"), "{}", text);
        assert!(text.contains("unknown_tool returned: Error: No tool named 'unknown_tool'"), "{}", text);
    }

    #[tokio::test]
    async fn failed_run_is_a_processing_error() {
        let store = InMemorySessionStore::new();
        let registry = registry(McpApprovalMode::Always);
        let session = session_with_plan(&store, &registry, vec![]).await;
        store.fail_next_run("rate limited").await;
        let ctx = RunContext {
            store: &store,
            registry: &registry,
            policy: &DenyAll,
            options: RunOptions::default(),
        };

        let err = process_run(&ctx, &session, &mut |_| {}).await.unwrap_err();
        match err {
            ProcessingError::RunFailed { status, message, .. } => {
                assert_eq!(status, "failed");
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_policy_hits_run_timeout() {
        struct Stalls;

        #[async_trait]
        impl ApprovalPolicy for Stalls {
            async fn decide(&self, _request: &ToolCallRequest) -> ApprovalDecision {
                tokio::time::sleep(Duration::from_secs(600)).await;
                ApprovalDecision::approve()
            }
        }

        let store = InMemorySessionStore::new();
        let registry = registry(McpApprovalMode::Always);
        let session = session_with_plan(&store, &registry, vec![order_call(), order_call()]).await;
        let ctx = RunContext {
            store: &store,
            registry: &registry,
            policy: &Stalls,
            options: RunOptions {
                poll_interval: Duration::from_millis(10),
                run_timeout: Duration::from_secs(60),
            },
        };

        let err = process_run(&ctx, &session, &mut |_| {}).await.unwrap_err();
        assert!(matches!(err, ProcessingError::RunTimeout { .. }), "{:?}", err);

        // The abandoned run was cancelled on the service side.
        let run_id = match err {
            ProcessingError::RunTimeout { run_id, .. } => run_id,
            _ => unreachable!(),
        };
        let run = store.get_run(&session, &run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }
}
