//! In-process fake of the hosted agent service.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clinical_assistant::agent::{
    Agent, AgentDefinition, AgentService, AgentServiceError, InvocationLoop, InvocationSettings,
    MessageContent, MessageRole, RequiredAction, Run, RunError, RunStatus,
    SubmitToolOutputsAction, TextValue, ThreadMessage, ToolCall, ToolCallFunction, ToolOutput,
};
use clinical_assistant::session::ThreadRegistry;
use clinical_assistant::tools::ToolRegistry;

/// How the fake behaves once a run is created.
#[derive(Debug, Clone)]
pub enum Script {
    /// Reply with this text after one poll.
    Reply(String),
    /// Ask for one tool call, then echo its output as the reply.
    ToolThenReply { tool: String, arguments: String },
    /// Ask for the same tool call forever.
    EndlessTools { tool: String, arguments: String },
    /// Complete without any assistant text.
    Silent,
    /// Stay in progress forever.
    Hang,
    /// Fail on the first poll.
    Fail,
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub threads_created: usize,
    pub runs_created: usize,
    pub tool_outputs: Vec<ToolOutput>,
    pub cancelled_runs: Vec<String>,
    pub agents: Vec<AgentDefinition>,
    pub run_tools: Vec<usize>,
}

#[derive(Debug)]
pub struct FakeAgentService {
    script: Script,
    thread_delay: Duration,
    stall_messages: bool,
    messages: Mutex<HashMap<String, Vec<ThreadMessage>>>,
    runs: Mutex<HashMap<String, Run>>,
    pub recorded: Mutex<Recorded>,
}

impl FakeAgentService {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            thread_delay: Duration::ZERO,
            stall_messages: false,
            messages: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Slow down thread creation so concurrent first turns overlap.
    pub fn with_thread_delay(mut self, delay: Duration) -> Self {
        self.thread_delay = delay;
        self
    }

    /// Never answer message posts.
    pub fn with_stalled_messages(mut self) -> Self {
        self.stall_messages = true;
        self
    }

    pub fn threads_created(&self) -> usize {
        self.recorded.lock().unwrap().threads_created
    }

    pub fn runs_created(&self) -> usize {
        self.recorded.lock().unwrap().runs_created
    }

    pub fn cancelled_runs(&self) -> Vec<String> {
        self.recorded.lock().unwrap().cancelled_runs.clone()
    }

    pub fn tool_outputs(&self) -> Vec<ToolOutput> {
        self.recorded.lock().unwrap().tool_outputs.clone()
    }

    fn push_message(&self, thread_id: &str, role: MessageRole, run_id: Option<&str>, text: &str) -> ThreadMessage {
        let mut messages = self.messages.lock().unwrap();
        let thread = messages.entry(thread_id.to_string()).or_default();
        let message = ThreadMessage {
            id: format!("msg_{}", thread.len() + 1),
            role,
            run_id: run_id.map(str::to_string),
            content: vec![MessageContent::Text {
                text: TextValue { value: text.to_string() },
            }],
            created_at: i64::try_from(thread.len()).unwrap_or_default(),
        };
        thread.push(message.clone());
        message
    }

    fn store_run(&self, run: Run) -> Run {
        self.runs.lock().unwrap().insert(run.id.clone(), run.clone());
        run
    }

    fn requires_tool(run: &Run, tool: &str, arguments: &str, round: usize) -> Run {
        Run {
            status: RunStatus::RequiresAction,
            required_action: Some(RequiredAction {
                submit_tool_outputs: Some(SubmitToolOutputsAction {
                    tool_calls: vec![ToolCall {
                        id: format!("call_{round}"),
                        call_type: "function".into(),
                        function: ToolCallFunction {
                            name: tool.to_string(),
                            arguments: arguments.to_string(),
                        },
                    }],
                }),
            }),
            ..run.clone()
        }
    }

    fn with_status(run: &Run, status: RunStatus) -> Run {
        Run {
            status,
            required_action: None,
            ..run.clone()
        }
    }
}

#[async_trait]
impl AgentService for FakeAgentService {
    async fn create_thread(&self) -> Result<String, AgentServiceError> {
        if !self.thread_delay.is_zero() {
            tokio::time::sleep(self.thread_delay).await;
        }
        let mut recorded = self.recorded.lock().unwrap();
        recorded.threads_created += 1;
        Ok(format!("thread_{}", recorded.threads_created))
    }

    async fn create_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ThreadMessage, AgentServiceError> {
        if self.stall_messages {
            std::future::pending::<()>().await;
        }
        let active = self
            .runs
            .lock()
            .unwrap()
            .values()
            .any(|run| run.thread_id == thread_id && !run.status.is_terminal());
        if active {
            return Err(AgentServiceError::Status {
                status: 400,
                body: format!("Can't add messages to {thread_id} while a run is active."),
            });
        }
        Ok(self.push_message(thread_id, role, None, content))
    }

    async fn create_run(
        &self,
        thread_id: &str,
        _agent_id: &str,
        tools: &[serde_json::Value],
    ) -> Result<Run, AgentServiceError> {
        let id = {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.runs_created += 1;
            recorded.run_tools.push(tools.len());
            format!("run_{}", recorded.runs_created)
        };
        let run = Run {
            id,
            thread_id: thread_id.to_string(),
            status: RunStatus::Queued,
            required_action: None,
            last_error: None,
        };
        let run = match &self.script {
            Script::ToolThenReply { tool, arguments } | Script::EndlessTools { tool, arguments } => {
                Self::requires_tool(&run, tool, arguments, 1)
            }
            _ => run,
        };
        Ok(self.store_run(run))
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError> {
        let run = self
            .runs
            .lock()
            .unwrap()
            .get(run_id)
            .cloned()
            .ok_or_else(|| AgentServiceError::Status {
                status: 404,
                body: format!("no run {run_id}"),
            })?;

        let next = match &self.script {
            Script::Reply(text) => {
                self.push_message(thread_id, MessageRole::Assistant, Some(run_id), text);
                Self::with_status(&run, RunStatus::Completed)
            }
            Script::Silent => Self::with_status(&run, RunStatus::Completed),
            Script::Hang => Self::with_status(&run, RunStatus::InProgress),
            Script::Fail => Run {
                last_error: Some(RunError {
                    code: "server_error".into(),
                    message: "model unavailable".into(),
                }),
                ..Self::with_status(&run, RunStatus::Failed)
            },
            Script::ToolThenReply { .. } | Script::EndlessTools { .. } => run,
        };
        Ok(self.store_run(next))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run, AgentServiceError> {
        let round = {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.tool_outputs.extend_from_slice(outputs);
            recorded.tool_outputs.len()
        };
        let run = self.runs.lock().unwrap().get(run_id).cloned().ok_or_else(|| {
            AgentServiceError::Status {
                status: 404,
                body: format!("no run {run_id}"),
            }
        })?;

        let next = match &self.script {
            Script::EndlessTools { tool, arguments } => {
                Self::requires_tool(&run, tool, arguments, round + 1)
            }
            _ => {
                let echoed: Vec<&str> = outputs.iter().map(|o| o.output.as_str()).collect();
                self.push_message(
                    thread_id,
                    MessageRole::Assistant,
                    Some(run_id),
                    &format!("Based on the tool: {}", echoed.join("; ")),
                );
                Self::with_status(&run, RunStatus::Completed)
            }
        };
        Ok(self.store_run(next))
    }

    async fn cancel_run(&self, _thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError> {
        self.recorded
            .lock()
            .unwrap()
            .cancelled_runs
            .push(run_id.to_string());
        let run = self.runs.lock().unwrap().get(run_id).cloned().ok_or_else(|| {
            AgentServiceError::Status {
                status: 404,
                body: format!("no run {run_id}"),
            }
        })?;
        Ok(self.store_run(Self::with_status(&run, RunStatus::Cancelled)))
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        run_id: Option<&str>,
    ) -> Result<Vec<ThreadMessage>, AgentServiceError> {
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .get(thread_id)
            .map(|all| {
                all.iter()
                    .rev()
                    .filter(|m| run_id.is_none() || m.run_id.as_deref() == run_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_agent(&self, definition: &AgentDefinition) -> Result<Agent, AgentServiceError> {
        self.recorded.lock().unwrap().agents.push(definition.clone());
        Ok(Agent {
            id: "asst_healthcare".into(),
            name: Some(definition.name.clone()),
            model: Some(definition.model.clone()),
        })
    }
}

pub fn fast_settings() -> InvocationSettings {
    InvocationSettings {
        run_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(5),
        max_tool_rounds: 3,
    }
}

/// An invocation loop over `service` with `tools`.
pub fn invocation(
    service: &Arc<FakeAgentService>,
    tools: ToolRegistry,
    settings: InvocationSettings,
) -> InvocationLoop {
    let service: Arc<dyn AgentService> = Arc::clone(service) as Arc<dyn AgentService>;
    InvocationLoop::new(
        Arc::clone(&service),
        ThreadRegistry::new(service),
        tools,
        "asst_healthcare",
        settings,
    )
}
