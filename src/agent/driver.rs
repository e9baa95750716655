//! Turn driver: the interactive conversation loop.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::approval::ApprovalPolicy;
use crate::error::{CleanupError, ProcessingError};
use crate::session::{Role, Session, SessionStore, Turn};
use crate::tools::ToolRegistry;

use super::guard::SessionGuard;
use super::run::{process_run, RunContext, RunOptions};
use super::TurnState;

/// Collaborators shared by every turn, fixed at construction.
#[derive(Clone)]
pub struct AgentContext {
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<ToolRegistry>,
    pub policy: Arc<dyn ApprovalPolicy>,
    pub options: RunOptions,
}

/// Result of handling one line of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Text of the agent's reply (may be empty)
    Reply(String),
    /// The turn failed; the conversation goes on
    Failed(String),
    /// Blank input, nothing submitted
    Skipped,
    /// The user asked to leave
    Exit,
}

pub struct TurnDriver {
    ctx: AgentContext,
    session: Session,
    guard: SessionGuard,
    state: TurnState,
}

impl TurnDriver {
    pub fn new(ctx: AgentContext, session: Session) -> Self {
        let guard = SessionGuard::new(ctx.store.clone(), session.clone());
        Self {
            ctx,
            session,
            guard,
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Handle one line typed by the user.
    pub async fn handle_input(&mut self, line: &str) -> TurnOutcome {
        let text = line.trim();
        if is_exit_command(text) {
            self.state = TurnState::Terminating;
            return TurnOutcome::Exit;
        }
        if text.is_empty() {
            return TurnOutcome::Skipped;
        }

        match self.run_turn(text).await {
            Ok(reply) => TurnOutcome::Reply(reply),
            Err(e) => {
                tracing::warn!("Turn failed: {}", e);
                TurnOutcome::Failed(e.to_string())
            }
        }
    }

    async fn run_turn(&mut self, text: &str) -> Result<String, ProcessingError> {
        let session = self.session.clone();
        let result = self.submit_and_process(&session, text).await;
        self.state = TurnState::Idle;
        result
    }

    async fn submit_and_process(
        &mut self,
        session: &Session,
        text: &str,
    ) -> Result<String, ProcessingError> {
        self.ctx
            .store
            .append_turn(session, Role::User, text)
            .await?;
        self.state = TurnState::Submitted;

        let ctx = RunContext {
            store: self.ctx.store.as_ref(),
            registry: &self.ctx.registry,
            policy: self.ctx.policy.as_ref(),
            options: self.ctx.options,
        };
        let state = &mut self.state;
        process_run(&ctx, session, &mut |next| {
            tracing::debug!(from = ?*state, to = ?next, "Turn state");
            *state = next;
        })
        .await?;
        self.state = TurnState::Completed;

        let turns = self.ctx.store.list_turns(session).await?;
        Ok(latest_reply(&turns))
    }

    /// Read lines from `input` and answer on `output` until the user exits or
    /// input ends.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        loop {
            output.write_all(b"You: ").await?;
            output.flush().await?;

            let Some(line) = lines.next_line().await? else {
                output.write_all(b"\n").await?;
                self.state = TurnState::Terminating;
                break;
            };

            match self.handle_input(&line).await {
                TurnOutcome::Exit => break,
                TurnOutcome::Skipped => continue,
                TurnOutcome::Reply(reply) => {
                    output.write_all(reply.as_bytes()).await?;
                    output.write_all(b"\n").await?;
                }
                TurnOutcome::Failed(message) => {
                    output
                        .write_all(format!("Error: {}\n", message).as_bytes())
                        .await?;
                }
            }
        }
        output.flush().await
    }

    /// Run the loop on a task of its own and delete the session however it
    /// ends: exit, end of input, an I/O error, a panic inside the loop, or
    /// `interrupt` resolving first.
    pub async fn run_guarded<R, W, I>(
        mut self,
        input: R,
        output: W,
        interrupt: I,
    ) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        I: Future<Output = ()>,
    {
        let mut guard = self.guard.detach();
        let mut task = tokio::spawn(async move { self.run(input, output).await });

        let finished = tokio::select! {
            joined = &mut task => Some(joined),
            _ = interrupt => None,
        };

        let result = match finished {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                tracing::error!("Conversation loop ended abnormally: {}", e);
                Err(std::io::Error::other(e))
            }
            None => {
                tracing::info!("Interrupted, ending the conversation");
                task.abort();
                let _ = task.await;
                Ok(())
            }
        };

        if let Err(e) = guard.release().await {
            tracing::warn!("{}", e);
        }
        result
    }

    /// Delete the session. Safe to call more than once.
    pub async fn shutdown(&mut self) -> Result<(), CleanupError> {
        self.state = TurnState::Terminating;
        self.guard.release().await
    }
}

fn is_exit_command(text: &str) -> bool {
    text.eq_ignore_ascii_case("exit") || text.eq_ignore_ascii_case("quit")
}

/// Text of the newest turn when the agent wrote it, else empty.
fn latest_reply(turns: &[Turn]) -> String {
    turns
        .first()
        .filter(|t| t.role == Role::Agent)
        .and_then(Turn::text)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::io::{AsyncWriteExt, BufReader};

    use crate::approval::{ApprovalDecision, ApproveAll, DenyAll, ToolCallRequest};
    use crate::session::{AgentConfig, InMemorySessionStore, PlannedCall};
    use crate::tools::{McpApprovalMode, McpTool};

    struct CountingApprove(Arc<AtomicUsize>);

    #[async_trait]
    impl ApprovalPolicy for CountingApprove {
        async fn decide(&self, _request: &ToolCallRequest) -> ApprovalDecision {
            self.0.fetch_add(1, Ordering::SeqCst);
            ApprovalDecision::approve()
        }
    }

    async fn driver(
        store: &InMemorySessionStore,
        policy: Arc<dyn ApprovalPolicy>,
    ) -> TurnDriver {
        let mut mcp = McpTool::new("contoso_pizza", "https://mcp.example.com/sse", vec![]);
        mcp.set_approval_mode(McpApprovalMode::Always);
        let mut registry = ToolRegistry::new();
        registry.register(mcp).unwrap();

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

        TurnDriver::new(
            AgentContext {
                store: Arc::new(store.clone()),
                registry: Arc::new(registry),
                policy,
                options: RunOptions::default(),
            },
            session,
        )
    }

    async fn converse(driver: &mut TurnDriver, input: &[u8]) -> String {
        let reader = BufReader::new(tokio_test::io::Builder::new().read(input).build());
        let mut output = Vec::new();
        driver.run(reader, &mut output).await.unwrap();
        String::from_utf8(output).unwrap()
    }

    #[tokio::test]
    async fn hello_then_exit_runs_once_and_cleans_up_once() {
        let store = InMemorySessionStore::new();
        let mut driver = driver(&store, Arc::new(ApproveAll::new())).await;

        let transcript = converse(&mut driver, b"hello\nexit\n").await;
        driver.shutdown().await.unwrap();
        driver.shutdown().await.unwrap();

        assert_eq!(transcript, "You: You said: hello\nYou: ");
        assert_eq!(store.runs_created(), 1);
        assert_eq!(store.delete_calls(), 1);
        assert_eq!(store.session_count().await, 0);
        assert_eq!(driver.state(), TurnState::Terminating);
    }

    fn place_order() -> PlannedCall {
        PlannedCall::Mcp {
            server_label: "contoso_pizza".to_string(),
            name: "place_order".to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn guarded_run_cleans_up_after_exit() {
        let store = InMemorySessionStore::new();
        let driver = driver(&store, Arc::new(ApproveAll::new())).await;
        let input = tokio_test::io::Builder::new().read(b"hello\nexit\n").build();

        driver
            .run_guarded(BufReader::new(input), tokio::io::sink(), std::future::pending())
            .await
            .unwrap();

        assert_eq!(store.runs_created(), 1);
        assert_eq!(store.delete_calls(), 1);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn panic_inside_the_loop_still_deletes_the_session() {
        struct Crashes;

        #[async_trait]
        impl ApprovalPolicy for Crashes {
            async fn decide(&self, _request: &ToolCallRequest) -> ApprovalDecision {
                panic!("approval prompt crashed")
            }
        }

        let store = InMemorySessionStore::new();
        store.set_plan(vec![place_order()]).await;
        let driver = driver(&store, Arc::new(Crashes)).await;
        let (mut keyboard, stdin) = tokio::io::duplex(64);
        keyboard.write_all(b"order\n").await.unwrap();

        let err = driver
            .run_guarded(BufReader::new(stdin), tokio::io::sink(), std::future::pending())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("panicked"), "{}", err);
        assert_eq!(store.delete_calls(), 1);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn interrupt_ends_the_loop_and_deletes_the_session() {
        let store = InMemorySessionStore::new();
        let driver = driver(&store, Arc::new(ApproveAll::new())).await;
        // Input stays open and silent, so only the interrupt can end the loop.
        let (_keyboard, stdin) = tokio::io::duplex(64);
        let (interrupt, interrupted) = tokio::sync::oneshot::channel::<()>();

        let conversation = tokio::spawn(driver.run_guarded(
            BufReader::new(stdin),
            tokio::io::sink(),
            async move {
                let _ = interrupted.await;
            },
        ));
        tokio::task::yield_now().await;
        interrupt.send(()).unwrap();
        conversation.await.unwrap().unwrap();

        assert_eq!(store.runs_created(), 0);
        assert_eq!(store.delete_calls(), 1);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn exit_is_case_insensitive() {
        let store = InMemorySessionStore::new();
        let mut driver = driver(&store, Arc::new(ApproveAll::new())).await;

        assert_eq!(driver.handle_input("  QUIT ").await, TurnOutcome::Exit);
        assert_eq!(driver.state(), TurnState::Terminating);
        assert_eq!(store.runs_created(), 0);
    }

    #[tokio::test]
    async fn blank_lines_and_eof_submit_nothing() {
        let store = InMemorySessionStore::new();
        let mut driver = driver(&store, Arc::new(ApproveAll::new())).await;

        let transcript = converse(&mut driver, b"\n   \n").await;

        assert_eq!(transcript, "You: You: You: \n");
        assert_eq!(store.runs_created(), 0);
    }

    #[tokio::test]
    async fn approvals_are_requested_once_per_call() {
        let store = InMemorySessionStore::new();
        store
            .set_plan(vec![PlannedCall::Mcp {
                server_label: "contoso_pizza".to_string(),
                name: "place_order".to_string(),
                arguments: "{}".to_string(),
            }])
            .await;
        let decisions = Arc::new(AtomicUsize::new(0));
        let mut driver = driver(&store, Arc::new(CountingApprove(decisions.clone()))).await;

        let outcome = driver.handle_input("one large margherita").await;

        assert_eq!(decisions.load(Ordering::SeqCst), 1);
        assert_eq!(driver.state(), TurnState::Idle);
        match outcome {
            TurnOutcome::Reply(reply) => assert!(reply.contains("place_order approved"), "{}", reply),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn denied_turn_still_replies() {
        let store = InMemorySessionStore::new();
        store
            .set_plan(vec![PlannedCall::Mcp {
                server_label: "contoso_pizza".to_string(),
                name: "place_order".to_string(),
                arguments: "{}".to_string(),
            }])
            .await;
        let mut driver = driver(&store, Arc::new(DenyAll)).await;

        match driver.handle_input("order").await {
            TurnOutcome::Reply(reply) => assert!(reply.contains("place_order was declined")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn processing_errors_do_not_end_the_loop() {
        let store = InMemorySessionStore::new();
        let mut driver = driver(&store, Arc::new(ApproveAll::new())).await;
        store.fail_next_run("model overloaded").await;

        let transcript = converse(&mut driver, b"first\nsecond\nexit\n").await;

        assert!(transcript.contains("Error: Run "), "{}", transcript);
        assert!(transcript.contains("model overloaded"), "{}", transcript);
        assert!(transcript.contains("You said: second"), "{}", transcript);
        assert_eq!(store.runs_created(), 2);
    }

    #[test]
    fn reply_is_empty_when_newest_turn_is_not_the_agents() {
        let turn = Turn {
            id: "msg_1".to_string(),
            role: Role::User,
            content: vec![],
            created_at: chrono::Utc::now(),
        };
        assert_eq!(latest_reply(&[turn]), "");
        assert_eq!(latest_reply(&[]), "");
    }
}
