//! One chat turn against the hosted agent.
//!
//! A turn resolves the user's thread, posts the message, starts a run and
//! drives it to a terminal status: polling while it is queued or in progress,
//! executing requested tool calls through the [`ToolRegistry`] and submitting
//! their outputs. Every step of the turn, from waiting on the user's previous
//! turn to reading the reply, is bounded by one deadline and a
//! [`CancellationToken`]; once a run exists either one cancels it before
//! returning.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AgentService, AgentServiceError, MessageRole, Run, RunStatus, ThreadMessage, ToolCall, ToolOutput};
use crate::session::ThreadRegistry;
use crate::tools::ToolRegistry;

/// Reply used when a run produced no assistant text.
pub const FALLBACK_REPLY: &str = "I couldn't generate a response.";

/// How long a best-effort run cancellation may take.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Bounds for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationSettings {
    /// Upper bound on a whole turn.
    pub run_timeout: Duration,
    pub poll_interval: Duration,
    /// Maximum `requires_action` rounds answered per run.
    pub max_tool_rounds: usize,
}

impl Default for InvocationSettings {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            max_tool_rounds: 10,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    Service(#[from] AgentServiceError),

    #[error("turn did not finish within {0:?}")]
    Timeout(Duration),

    #[error("turn was cancelled")]
    Cancelled,

    #[error("agent requested more than {0} rounds of tool calls")]
    ToolRoundsExceeded(usize),

    #[error("agent run ended with status {status}: {message}")]
    RunFailed { status: RunStatus, message: String },
}

impl InvocationError {
    /// Whether the hosted run may still be active and should be cancelled.
    fn abandons_run(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Cancelled | Self::ToolRoundsExceeded(_)
        )
    }
}

/// The reply of a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub reply: String,
    pub thread_id: String,
    pub run_id: String,
}

/// Runs chat turns for any user.
#[derive(Debug, Clone)]
pub struct InvocationLoop {
    service: Arc<dyn AgentService>,
    threads: ThreadRegistry,
    tools: ToolRegistry,
    agent_id: String,
    settings: InvocationSettings,
}

impl InvocationLoop {
    pub fn new(
        service: Arc<dyn AgentService>,
        threads: ThreadRegistry,
        tools: ToolRegistry,
        agent_id: impl Into<String>,
        settings: InvocationSettings,
    ) -> Self {
        Self {
            service,
            threads,
            tools,
            agent_id: agent_id.into(),
            settings,
        }
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Send `text` as `user_id` and wait for the agent's reply.
    #[tracing::instrument(skip(self, text, cancel), fields(thread_id = tracing::field::Empty, run_id = tracing::field::Empty))]
    pub async fn run_turn(
        &self,
        user_id: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnReply, InvocationError> {
        if cancel.is_cancelled() {
            return Err(InvocationError::Cancelled);
        }
        let deadline = Instant::now() + self.settings.run_timeout;

        // Held until the reply is read so one user's runs never overlap.
        let lease = self
            .bounded(cancel, deadline, self.threads.begin_turn(user_id))
            .await?;
        let thread_id = lease.thread_id.clone();
        tracing::Span::current().record("thread_id", thread_id.as_str());

        self.bounded(
            cancel,
            deadline,
            self.service.create_message(&thread_id, MessageRole::User, text),
        )
        .await?;

        let run = self
            .bounded(
                cancel,
                deadline,
                self.service
                    .create_run(&thread_id, &self.agent_id, &self.tools.definitions()),
            )
            .await?;
        let run_id = run.id.clone();
        tracing::Span::current().record("run_id", run_id.as_str());
        tracing::info!(status = %run.status, tool_count = self.tools.len(), "Run submitted");

        let outcome = async {
            let finished = self
                .bounded(cancel, deadline, self.drive_run(&thread_id, run))
                .await?;
            let reply = self
                .bounded(cancel, deadline, self.extract_reply(&thread_id, &finished.id))
                .await?;
            Ok::<_, InvocationError>((finished, reply))
        }
        .await;

        let (finished, reply) = match outcome {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(error = %e, "Run did not complete");
                if e.abandons_run() {
                    self.cancel_best_effort(&thread_id, &run_id).await;
                }
                return Err(e);
            }
        };
        drop(lease);
        tracing::info!(reply_length = reply.len(), status = %finished.status, "Turn complete");

        Ok(TurnReply {
            reply,
            thread_id,
            run_id,
        })
    }

    /// Await one step of a turn against the cancellation token and deadline.
    async fn bounded<T, E>(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        step: impl Future<Output = Result<T, E>>,
    ) -> Result<T, InvocationError>
    where
        InvocationError: From<E>,
    {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(InvocationError::Cancelled),
            finished = tokio::time::timeout_at(deadline, step) => match finished {
                Ok(result) => result.map_err(InvocationError::from),
                Err(_elapsed) => Err(InvocationError::Timeout(self.settings.run_timeout)),
            },
        }
    }

    /// Poll and answer tool calls until the run reaches a terminal status.
    async fn drive_run(&self, thread_id: &str, mut run: Run) -> Result<Run, InvocationError> {
        let mut rounds = 0;

        loop {
            match run.status {
                RunStatus::Completed | RunStatus::Incomplete => return Ok(run),
                RunStatus::Failed | RunStatus::Cancelled | RunStatus::Expired => {
                    let message = run
                        .last_error
                        .as_ref()
                        .map(|e| format!("{} {}", e.code, e.message).trim().to_string())
                        .unwrap_or_default();
                    return Err(InvocationError::RunFailed {
                        status: run.status,
                        message,
                    });
                }
                RunStatus::RequiresAction => {
                    if rounds >= self.settings.max_tool_rounds {
                        tracing::error!(
                            rounds,
                            max_rounds = self.settings.max_tool_rounds,
                            "Maximum tool rounds exceeded"
                        );
                        return Err(InvocationError::ToolRoundsExceeded(
                            self.settings.max_tool_rounds,
                        ));
                    }
                    rounds += 1;

                    let outputs = self.execute_tool_calls(run.pending_tool_calls()).await;
                    tracing::info!(round = rounds, outputs = outputs.len(), "Submitting tool outputs");
                    run = self
                        .service
                        .submit_tool_outputs(thread_id, &run.id, &outputs)
                        .await?;
                }
                RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                    run = self.service.get_run(thread_id, &run.id).await?;
                }
            }
        }
    }

    /// Run every requested call concurrently; failures become output text.
    async fn execute_tool_calls(&self, calls: &[ToolCall]) -> Vec<ToolOutput> {
        let pending = calls.iter().map(|call| async move {
            tracing::info!(
                tool_id = %call.id,
                tool = %call.function.name,
                args_length = call.function.arguments.len(),
                "Tool call to execute"
            );
            let outcome = self
                .tools
                .dispatch(&call.function.name, &call.function.arguments)
                .await;
            ToolOutput {
                tool_call_id: call.id.clone(),
                output: outcome.render().to_string(),
            }
        });
        futures::future::join_all(pending).await
    }

    async fn cancel_best_effort(&self, thread_id: &str, run_id: &str) {
        match tokio::time::timeout(CANCEL_GRACE, self.service.cancel_run(thread_id, run_id)).await {
            Ok(Ok(run)) => tracing::info!(status = %run.status, "Cancelled hosted run"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to cancel hosted run"),
            Err(_elapsed) => tracing::warn!(grace = ?CANCEL_GRACE, "Cancelling hosted run timed out"),
        }
    }

    /// Latest assistant text among the run's own messages.
    async fn extract_reply(&self, thread_id: &str, run_id: &str) -> Result<String, AgentServiceError> {
        let messages = self.service.list_messages(thread_id, Some(run_id)).await?;
        Ok(latest_assistant_text(&messages).unwrap_or_else(|| FALLBACK_REPLY.to_string()))
    }

    /// Clear a user's conversation.
    pub fn clear_history(&self, user_id: &str) -> Option<String> {
        self.threads.reset_thread(user_id)
    }

    /// Messages of the user's current thread, oldest first.
    ///
    /// `None` when the user has no thread.
    pub async fn history(
        &self,
        user_id: &str,
    ) -> Result<Option<(String, Vec<ThreadMessage>)>, AgentServiceError> {
        let Some(thread_id) = self.threads.current_thread(user_id) else {
            return Ok(None);
        };
        let mut messages = self.service.list_messages(&thread_id, None).await?;
        messages.reverse();
        Ok(Some((thread_id, messages)))
    }
}

/// First assistant message with text in a newest-first list.
fn latest_assistant_text(messages: &[ThreadMessage]) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .find_map(|m| m.text().filter(|t| !t.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MessageContent, TextValue};

    fn message(id: &str, role: MessageRole, text: Option<&str>) -> ThreadMessage {
        ThreadMessage {
            id: id.into(),
            role,
            run_id: Some("run_1".into()),
            content: text
                .map(|t| {
                    vec![MessageContent::Text {
                        text: TextValue { value: t.into() },
                    }]
                })
                .unwrap_or_default(),
            created_at: 0,
        }
    }

    #[test]
    fn test_latest_assistant_text_prefers_newest() {
        let messages = vec![
            message("m3", MessageRole::Assistant, Some("final answer")),
            message("m2", MessageRole::Assistant, Some("earlier")),
            message("m1", MessageRole::User, Some("question")),
        ];
        assert_eq!(latest_assistant_text(&messages).as_deref(), Some("final answer"));
    }

    #[test]
    fn test_latest_assistant_text_skips_non_text() {
        let messages = vec![
            message("m2", MessageRole::Assistant, None),
            message("m1", MessageRole::Assistant, Some("text reply")),
        ];
        assert_eq!(latest_assistant_text(&messages).as_deref(), Some("text reply"));
    }

    #[test]
    fn test_latest_assistant_text_skips_blank_text() {
        let messages = vec![
            message("m2", MessageRole::Assistant, Some("  \n")),
            message("m1", MessageRole::Assistant, Some("the real answer")),
        ];
        assert_eq!(latest_assistant_text(&messages).as_deref(), Some("the real answer"));
    }

    #[test]
    fn test_no_assistant_text() {
        let messages = vec![message("m1", MessageRole::User, Some("hello"))];
        assert_eq!(latest_assistant_text(&messages), None);
    }

    #[test]
    fn test_abandoned_runs_are_cancelled() {
        assert!(InvocationError::Cancelled.abandons_run());
        assert!(InvocationError::Timeout(Duration::from_secs(1)).abandons_run());
        assert!(
            !InvocationError::RunFailed {
                status: RunStatus::Failed,
                message: String::new()
            }
            .abandons_run()
        );
    }
}
