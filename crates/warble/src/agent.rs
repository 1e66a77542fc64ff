use anyhow::{anyhow, Context, Result};
use chrono::Local;
use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::cancellation::{CancellationRegistry, TurnGuard};
use crate::capabilities::{CapabilityMetadata, Toolbox};
use crate::catalog::Catalog;
use crate::errors::{StoreError, TurnError};
use crate::events::{StatusKind, TurnEvent};
use crate::models::message::{Message, MessageContent, MessageInput, ToolRequest};
use crate::prompt_template::{load_prompt, load_prompt_file};
use crate::providers::base::{Provider, ProviderDelta, Usage};
use crate::registry::CapabilityRegistry;
use crate::store::ConversationStore;

pub const DEFAULT_MAX_TURNS: usize = 16;

const SYSTEM_PROMPT: &str = include_str!("prompts/system.md");
const EVENT_BUFFER: usize = 64;
const INVALID_CALL_NAME: &str = "invalid_tool_call";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound on model calls within one turn
    pub max_turns: usize,
    /// Replaces the built-in system prompt template
    pub system_prompt_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt_file: None,
        }
    }
}

/// A user message to answer. Without a conversation id a new conversation is
/// started; without a tool list the agent's default selection applies.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: MessageInput,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

impl TurnRequest {
    pub fn new(message: impl Into<MessageInput>) -> Self {
        Self {
            conversation_id: None,
            message: message.into(),
            tools: None,
        }
    }

    pub fn in_conversation<S: Into<String>>(mut self, conversation_id: S) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_tools<S: Into<String>>(mut self, tools: impl IntoIterator<Item = S>) -> Self {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }
}

/// A running turn. The event stream ends after the terminal event.
pub struct TurnHandle {
    pub conversation_id: String,
    pub events: ReceiverStream<TurnEvent>,
}

/// Agent integrates a language model with the capabilities it may call and
/// the history of each conversation it takes part in
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn Provider>,
    store: Arc<dyn ConversationStore>,
    cancellations: Arc<CancellationRegistry>,
    toolbox: Toolbox,
    enabled: Vec<String>,
    config: AgentConfig,
}

impl Agent {
    /// Create an agent with every toolbox capability enabled by default
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn ConversationStore>,
        toolbox: Toolbox,
    ) -> Self {
        let enabled = toolbox.ids();
        Self {
            provider,
            store,
            cancellations: Arc::new(CancellationRegistry::new()),
            toolbox,
            enabled,
            config: AgentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Capability ids used by requests that do not name their own
    pub fn with_enabled<S: Into<String>>(mut self, enabled: impl IntoIterator<Item = S>) -> Self {
        self.enabled = enabled.into_iter().map(Into::into).collect();
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Presentation metadata for the default selection, taken from the same
    /// catalog a turn would offer the model
    pub fn list_tools(&self) -> Result<Vec<CapabilityMetadata>> {
        let registry = self.toolbox.registry(&self.enabled)?;
        Ok(Catalog::build(&registry)?.listing().to_vec())
    }

    /// Ask the running turn of a conversation to stop at its next checkpoint.
    /// Returns false when no turn is running.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let found = self.cancellations.signal(conversation_id);
        tracing::info!(conversation = %conversation_id, found, "cancellation requested");
        found
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.cancellations.is_running(conversation_id)
    }

    /// Delete a conversation that has no running turn. The turn slot is held
    /// for the duration so no turn can start on it mid-delete.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), TurnError> {
        let _guard = self.cancellations.begin(conversation_id)?;
        self.store.delete(conversation_id).await?;
        tracing::info!(conversation = %conversation_id, "conversation deleted");
        Ok(())
    }

    /// Start answering a message. The user message is stored before this
    /// returns; everything after runs on its own task and is reported through
    /// the handle's event stream.
    pub async fn submit(&self, request: TurnRequest) -> Result<TurnHandle, TurnError> {
        if request.message.is_empty() {
            return Err(TurnError::EmptyMessage);
        }

        let registry = match &request.tools {
            Some(tools) => self.toolbox.registry(tools)?,
            None => self.toolbox.registry(&self.enabled)?,
        };

        let conversation_id = match request.conversation_id {
            Some(id) => {
                if !self.store.exists(&id).await? {
                    return Err(StoreError::NotFound(id).into());
                }
                id
            }
            None => self.store.create().await?,
        };

        let guard = self.cancellations.begin(&conversation_id)?;
        self.store
            .append(&conversation_id, request.message.into_message())
            .await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let turn = Turn {
            agent: self.clone(),
            guard,
            registry,
            events: tx,
        };

        let span = tracing::info_span!("turn", conversation = %conversation_id);
        tokio::spawn(turn.run().instrument(span));

        Ok(TurnHandle {
            conversation_id,
            events: ReceiverStream::new(rx),
        })
    }

    fn system_prompt(&self, catalog: &Catalog) -> Result<String> {
        let mut context = HashMap::new();
        context.insert("catalog", catalog.summary.clone());
        context.insert("date", Local::now().format("%A, %B %-d, %Y").to_string());

        let prompt = match &self.config.system_prompt_file {
            Some(path) => load_prompt_file(path.clone(), &context)
                .with_context(|| format!("failed to render {}", path.display()))?,
            None => load_prompt(SYSTEM_PROMPT, &context)?,
        };
        Ok(prompt)
    }
}

enum Outcome {
    Done,
    Cancelled,
}

/// What a turn has produced so far that is not yet stored: the text of the
/// model call in flight and the usage of every call made
#[derive(Default)]
struct Progress {
    answer: String,
    usage: Usage,
}

struct Turn {
    agent: Agent,
    guard: TurnGuard,
    registry: CapabilityRegistry,
    events: mpsc::Sender<TurnEvent>,
}

impl Turn {
    fn conversation_id(&self) -> &str {
        self.guard.conversation_id()
    }

    async fn emit(&self, event: TurnEvent) {
        // A departed consumer does not stop the turn
        if self.events.send(event).await.is_err() {
            tracing::debug!("event consumer disconnected");
        }
    }

    async fn run(self) {
        tracing::info!(tools = self.registry.len(), "turn started");

        let mut progress = Progress::default();
        let driven = AssertUnwindSafe(self.drive(&mut progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("Turn stopped unexpectedly")));
        let outcome = match driven {
            Ok(outcome) => self.settle(outcome, &progress).await,
            Err(e) => {
                self.record_usage(&progress.usage).await.ok();
                Err(e)
            }
        };

        let conversation_id = self.conversation_id().to_string();
        let terminal = match outcome {
            Ok(Outcome::Done) => {
                tracing::info!(total_tokens = progress.usage.total_tokens, "turn done");
                TurnEvent::Done {
                    conversation_id,
                    usage: progress.usage,
                }
            }
            Ok(Outcome::Cancelled) => {
                tracing::info!("turn cancelled");
                TurnEvent::Cancelled { conversation_id }
            }
            Err(e) => {
                tracing::error!(error = ?e, "turn failed");
                TurnEvent::error(format!("{:#}", e))
            }
        };

        // Free the slot before the caller hears the turn is over so it can
        // immediately start the next one
        let Turn { guard, events, .. } = self;
        drop(guard);
        if events.send(terminal).await.is_err() {
            tracing::debug!("event consumer disconnected");
        }
    }

    async fn drive(&self, progress: &mut Progress) -> Result<Outcome> {
        let token = self.guard.token().clone();
        let catalog = Catalog::build(&self.registry)?;
        let system = self.agent.system_prompt(&catalog)?;
        let mut transcript = self.agent.store.get(self.conversation_id()).await?.messages;

        self.emit(TurnEvent::status("Thinking...", StatusKind::Thinking))
            .await;

        for _ in 0..self.agent.config.max_turns {
            if self.guard.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let mut requests = Vec::new();
            let mut call_usage = Usage::default();
            let mut call_text = String::new();
            {
                let mut stream = self
                    .agent
                    .provider
                    .stream(&system, &transcript, &catalog.tools);

                loop {
                    let delta = tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            // Text that reached the caller before the signal is kept
                            progress.answer = std::mem::take(&mut call_text);
                            return Ok(Outcome::Cancelled);
                        }
                        delta = stream.next() => delta,
                    };

                    match delta {
                        None => break,
                        Some(Err(e)) => return Err(e.context("model call failed")),
                        Some(Ok(ProviderDelta::Text(text))) => {
                            call_text.push_str(&text);
                            self.emit(TurnEvent::TextChunk { text }).await;
                        }
                        Some(Ok(ProviderDelta::ToolRequest(request))) => requests.push(request),
                        Some(Ok(ProviderDelta::Usage(usage))) => call_usage.add(&usage),
                    }
                }
            }

            progress.usage.add(&call_usage);
            if requests.is_empty() {
                progress.answer = call_text;
                return Ok(Outcome::Done);
            }

            // Text sent alongside tool calls precedes them in the history
            if !call_text.is_empty() {
                let message = Message::assistant().with_text(call_text);
                self.agent
                    .store
                    .append(self.conversation_id(), message.clone())
                    .await?;
                transcript.push(message);
            }

            tracing::debug!(count = requests.len(), "model requested tools");
            for request in &requests {
                let message = self.run_tool(request).await?;
                transcript.push(message);
                if self.guard.is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }
            }
        }

        Err(anyhow!(
            "Stopped after {} model calls without a final answer",
            self.agent.config.max_turns
        ))
    }

    /// Execute one requested call and store the request with its result
    async fn run_tool(&self, request: &ToolRequest) -> Result<Message> {
        let (tool_name, arguments) = match &request.tool_call {
            Ok(call) => (call.name.clone(), call.arguments.clone()),
            Err(_) => (INVALID_CALL_NAME.to_string(), Value::Null),
        };
        let display_name = self.registry.display_name(&tool_name);

        tracing::info!(tool = %tool_name, "dispatching tool call");
        self.emit(TurnEvent::ToolCall {
            tool_name: tool_name.clone(),
            display_name: display_name.clone(),
            arguments,
        })
        .await;

        let result = self.registry.execute_request(request).await;

        self.emit(TurnEvent::ToolResult {
            tool_name: tool_name.clone(),
            display_name,
            success: result.success,
            result: result.text(),
        })
        .await;

        let message = Message::tool(tool_name)
            .with_content(MessageContent::ToolRequest(request.clone()))
            .with_tool_response(&request.id, result);
        self.agent
            .store
            .append(self.conversation_id(), message.clone())
            .await?;
        Ok(message)
    }

    /// Store the closing assistant answer and usage of a turn that did not fail
    async fn settle(&self, outcome: Outcome, progress: &Progress) -> Result<Outcome> {
        let keep_answer = match outcome {
            Outcome::Done => true,
            Outcome::Cancelled => !progress.answer.is_empty(),
        };
        if keep_answer {
            self.agent
                .store
                .append(
                    self.conversation_id(),
                    Message::assistant().with_text(&progress.answer),
                )
                .await?;
        }
        self.record_usage(&progress.usage).await?;
        Ok(outcome)
    }

    async fn record_usage(&self, usage: &Usage) -> Result<()> {
        if *usage == Usage::default() {
            return Ok(());
        }
        self.agent
            .store
            .record_usage(self.conversation_id(), usage)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to record usage");
                e.into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capability;
    use crate::errors::{AgentError, AgentResult, CancelError, RegistryError};
    use crate::models::content::Content;
    use crate::models::role::Role;
    use crate::models::tool::{Tool, ToolCall};
    use crate::providers::mock::MockProvider;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Stands in for the weather capability with a fixed outcome
    struct StubWeather {
        metadata: CapabilityMetadata,
        tool: Tool,
        outcome: AgentResult<String>,
        delay: Duration,
    }

    impl StubWeather {
        fn new(outcome: AgentResult<String>) -> Self {
            Self {
                metadata: CapabilityMetadata::new("weather", "Weather"),
                tool: Tool::new(
                    "get_weather",
                    "Current weather",
                    json!({"type": "object", "properties": {}}),
                ),
                outcome,
                delay: Duration::ZERO,
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Capability for StubWeather {
        fn metadata(&self) -> &CapabilityMetadata {
            &self.metadata
        }

        fn descriptor(&self) -> &Tool {
            &self.tool
        }

        async fn execute(&self, _arguments: Value) -> AgentResult<Vec<Content>> {
            tokio::time::sleep(self.delay).await;
            self.outcome.clone().map(|text| vec![Content::text(text)])
        }
    }

    fn weather_request() -> Message {
        Message::assistant().with_tool_request(
            "call_1",
            Ok(ToolCall::new(
                "get_weather",
                json!({"latitude": 59.9, "longitude": 10.7}),
            )),
        )
    }

    fn agent_with(provider: MockProvider, weather: StubWeather) -> (Agent, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        let toolbox = Toolbox::new().with_capability(Arc::new(weather));
        let agent = Agent::new(
            provider.clone(),
            Arc::new(MemoryStore::new()),
            toolbox,
        );
        (agent, provider)
    }

    async fn collect(handle: TurnHandle) -> Vec<TurnEvent> {
        handle.events.collect().await
    }

    async fn wait_until_idle(agent: &Agent, id: &str) {
        for _ in 0..200 {
            if !agent.is_running(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("turn on {} never finished", id);
    }

    /// Fails every model call by panicking
    struct PanickingProvider;

    #[async_trait]
    impl Provider for PanickingProvider {
        async fn complete(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[Tool],
        ) -> Result<(Message, Usage)> {
            panic!("provider bug")
        }
    }

    fn kinds(events: &[TurnEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|event| match event {
                TurnEvent::Status { .. } => "status",
                TurnEvent::ToolCall { .. } => "tool_call",
                TurnEvent::ToolResult { .. } => "tool_result",
                TurnEvent::TextChunk { .. } => "text_chunk",
                TurnEvent::Done { .. } => "done",
                TurnEvent::Cancelled { .. } => "cancelled",
                TurnEvent::Error { .. } => "error",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_weather_turn() {
        let provider = MockProvider::new(vec![
            weather_request(),
            Message::assistant().with_text("It is 12°C and clear in Oslo."),
        ])
        .with_usage(Usage::new(10, 5, 15));
        let (agent, provider) =
            agent_with(provider, StubWeather::new(Ok("Clear sky, 12.0°C".to_string())));

        let handle = agent
            .submit(TurnRequest::new("What's the weather in Oslo?"))
            .await
            .unwrap();
        let id = handle.conversation_id.clone();
        let events = collect(handle).await;

        assert_eq!(
            kinds(&events),
            vec!["status", "tool_call", "tool_result", "text_chunk", "done"]
        );
        match &events[2] {
            TurnEvent::ToolResult {
                display_name,
                success,
                result,
                ..
            } => {
                assert_eq!(display_name, "Weather");
                assert!(*success);
                assert_eq!(result, "Clear sky, 12.0°C");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            events[4],
            TurnEvent::Done {
                conversation_id: id.clone(),
                usage: Usage::new(20, 10, 30),
            }
        );

        // user, tool, assistant
        let conversation = agent.store().get(&id).await.unwrap();
        let roles: Vec<_> = conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Tool, Role::Assistant]);
        assert_eq!(conversation.messages[1].tool_name.as_deref(), Some("get_weather"));
        assert_eq!(conversation.summary.usage.total_tokens, 30);

        // The second model call saw the tool result
        let transcripts = provider.transcripts();
        assert_eq!(transcripts.len(), 2);
        assert_eq!(transcripts[1].last().unwrap().role, Role::Tool);
        assert!(!agent.is_running(&id));
    }

    #[tokio::test]
    async fn test_failing_tool_does_not_end_turn() {
        let provider = MockProvider::new(vec![
            weather_request(),
            Message::assistant().with_text("The weather service is not responding."),
        ]);
        let (agent, _) = agent_with(
            provider,
            StubWeather::new(Err(AgentError::ExecutionError("upstream timeout".into()))),
        );

        let handle = agent.submit(TurnRequest::new("Weather?")).await.unwrap();
        let events = collect(handle).await;

        assert_eq!(
            kinds(&events),
            vec!["status", "tool_call", "tool_result", "text_chunk", "done"]
        );
        assert!(matches!(
            &events[2],
            TurnEvent::ToolResult { success: false, result, .. } if result.contains("upstream timeout")
        ));
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_failed_result() {
        let provider = MockProvider::new(vec![
            Message::assistant()
                .with_tool_request("c", Ok(ToolCall::new("launch_rockets", json!({})))),
            Message::assistant().with_text("I can't do that."),
        ]);
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("unused".into())));

        let events = collect(agent.submit(TurnRequest::new("Go")).await.unwrap()).await;
        assert!(matches!(
            &events[2],
            TurnEvent::ToolResult { success: false, display_name, .. } if display_name == "launch_rockets"
        ));
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_model_error_ends_turn_without_persisting() {
        let provider = MockProvider::scripted(vec![Err("connection refused".to_string())]);
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("unused".into())));

        let handle = agent.submit(TurnRequest::new("Hello")).await.unwrap();
        let id = handle.conversation_id.clone();
        let events = collect(handle).await;

        assert_eq!(kinds(&events), vec!["status", "error"]);
        assert!(matches!(
            &events[1],
            TurnEvent::Error { message } if message.contains("connection refused")
        ));
        let conversation = agent.store().get(&id).await.unwrap();
        assert_eq!(conversation.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_emitted_text() {
        let provider = MockProvider::new(vec![Message::assistant()
            .with_text("The ")
            .with_text("answer ")
            .with_text("is 42.")])
        .with_delay(Duration::from_millis(100));
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("unused".into())));

        let mut handle = agent.submit(TurnRequest::new("Question?")).await.unwrap();
        let id = handle.conversation_id.clone();

        let mut events = Vec::new();
        while let Some(event) = handle.events.next().await {
            if matches!(event, TurnEvent::TextChunk { .. }) {
                assert!(agent.cancel(&id));
            }
            events.push(event);
        }

        assert_eq!(kinds(&events), vec!["status", "text_chunk", "cancelled"]);
        let conversation = agent.store().get(&id).await.unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].as_concat_text(), "The ");
    }

    #[tokio::test]
    async fn test_cancel_during_tool_waits_for_result() {
        let provider = MockProvider::new(vec![
            weather_request(),
            Message::assistant().with_text("never sent"),
        ]);
        let weather = StubWeather::new(Ok("Rain".into())).slow(Duration::from_millis(100));
        let (agent, provider) = agent_with(provider, weather);

        let mut handle = agent.submit(TurnRequest::new("Weather?")).await.unwrap();
        let id = handle.conversation_id.clone();

        let mut events = Vec::new();
        while let Some(event) = handle.events.next().await {
            if matches!(event, TurnEvent::ToolCall { .. }) {
                agent.cancel(&id);
            }
            events.push(event);
        }

        assert_eq!(
            kinds(&events),
            vec!["status", "tool_call", "tool_result", "cancelled"]
        );
        // user and tool message, no assistant text was produced
        let conversation = agent.store().get(&id).await.unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(provider.transcripts().len(), 1);
    }

    #[tokio::test]
    async fn test_second_turn_rejected_while_running() {
        let provider = MockProvider::new(vec![
            Message::assistant().with_text("first"),
            Message::assistant().with_text("second"),
        ])
        .with_delay(Duration::from_millis(50));
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("unused".into())));

        let handle = agent.submit(TurnRequest::new("one")).await.unwrap();
        let id = handle.conversation_id.clone();

        let result = agent
            .submit(TurnRequest::new("two").in_conversation(&id))
            .await;
        assert!(matches!(
            result,
            Err(TurnError::Busy(CancelError::AlreadyRunning(ref busy))) if *busy == id
        ));

        collect(handle).await;
        let handle = agent
            .submit(TurnRequest::new("two").in_conversation(&id))
            .await
            .unwrap();
        let events = collect(handle).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));

        let conversation = agent.store().get(&id).await.unwrap();
        let texts: Vec<_> = conversation
            .messages
            .iter()
            .map(Message::as_concat_text)
            .collect();
        assert_eq!(texts, vec!["one", "first", "two", "second"]);
    }

    #[tokio::test]
    async fn test_rejected_requests() {
        let (agent, _) = agent_with(MockProvider::new(vec![]), StubWeather::new(Ok("".into())));

        let result = agent.submit(TurnRequest::new("   ")).await;
        assert!(matches!(result, Err(TurnError::EmptyMessage)));

        let result = agent
            .submit(TurnRequest::new("hi").in_conversation("missing"))
            .await;
        assert!(matches!(result, Err(TurnError::Store(StoreError::NotFound(_)))));

        let result = agent
            .submit(TurnRequest::new("hi").with_tools(["weather", "weather"]))
            .await;
        assert!(matches!(
            result,
            Err(TurnError::Registry(RegistryError::DuplicateCapability(_)))
        ));

        assert!(agent.store().list().await.unwrap().is_empty());
        assert!(!agent.cancel("missing"));
    }

    #[tokio::test]
    async fn test_max_turns_bound() {
        let provider = MockProvider::new(vec![weather_request(), weather_request(), weather_request()]);
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("Sunny".into())));
        let agent = agent.with_config(AgentConfig {
            max_turns: 2,
            system_prompt_file: None,
        });

        let events = collect(agent.submit(TurnRequest::new("Loop")).await.unwrap()).await;
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Error { message }) if message.contains("2 model calls")
        ));
        assert_eq!(
            kinds(&events).iter().filter(|k| **k == "tool_result").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_request_tool_selection() {
        let provider = MockProvider::new(vec![Message::assistant().with_text("ok")]);
        let (agent, provider) = agent_with(provider, StubWeather::new(Ok("".into())));

        let handle = agent
            .submit(TurnRequest::new("hi").with_tools(Vec::<String>::new()))
            .await
            .unwrap();
        collect(handle).await;

        assert_eq!(agent.list_tools().unwrap()[0].id, "weather");
        assert_eq!(provider.transcripts().len(), 1);
    }

    #[tokio::test]
    async fn test_text_before_tool_call_is_stored_before_it() {
        let provider = MockProvider::new(vec![
            Message::assistant().with_text("Let me check.").with_tool_request(
                "call_1",
                Ok(ToolCall::new("get_weather", json!({"latitude": 59.9}))),
            ),
            Message::assistant().with_text("It is 12°C."),
        ]);
        let (agent, provider) = agent_with(provider, StubWeather::new(Ok("Clear".into())));

        let handle = agent.submit(TurnRequest::new("Weather?")).await.unwrap();
        let id = handle.conversation_id.clone();
        let events = collect(handle).await;

        assert_eq!(
            kinds(&events),
            vec!["status", "text_chunk", "tool_call", "tool_result", "text_chunk", "done"]
        );

        let conversation = agent.store().get(&id).await.unwrap();
        let roles: Vec<_> = conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(conversation.messages[1].as_concat_text(), "Let me check.");
        assert_eq!(conversation.messages[3].as_concat_text(), "It is 12°C.");

        // The follow-up call sees what the model already said
        let transcripts = provider.transcripts();
        let second: Vec<_> = transcripts[1].iter().map(|m| m.role).collect();
        assert_eq!(second, vec![Role::User, Role::Assistant, Role::Tool]);
        assert_eq!(transcripts[1][1].as_concat_text(), "Let me check.");
    }

    #[tokio::test]
    async fn test_tool_calls_run_in_request_order() {
        let provider = MockProvider::new(vec![
            Message::assistant()
                .with_tool_request("call_a", Ok(ToolCall::new("get_weather", json!({"city": "Oslo"}))))
                .with_tool_request("call_b", Ok(ToolCall::new("get_weather", json!({"city": "Rome"})))),
            Message::assistant().with_text("Oslo is colder."),
        ]);
        let weather = StubWeather::new(Ok("Clear".into())).slow(Duration::from_millis(20));
        let (agent, _) = agent_with(provider, weather);

        let handle = agent.submit(TurnRequest::new("Compare")).await.unwrap();
        let id = handle.conversation_id.clone();
        let events = collect(handle).await;

        assert_eq!(
            kinds(&events),
            vec![
                "status",
                "tool_call",
                "tool_result",
                "tool_call",
                "tool_result",
                "text_chunk",
                "done"
            ]
        );
        let cities: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::ToolCall { arguments, .. } => arguments["city"].as_str(),
                _ => None,
            })
            .collect();
        assert_eq!(cities, vec!["Oslo", "Rome"]);

        let conversation = agent.store().get(&id).await.unwrap();
        let request_ids: Vec<_> = conversation
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.content[0].as_tool_request())
            .map(|request| request.id.as_str())
            .collect();
        assert_eq!(request_ids, vec!["call_a", "call_b"]);
        assert_eq!(conversation.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_turn_completes_after_consumer_disconnects() {
        let provider = MockProvider::new(vec![
            weather_request(),
            Message::assistant().with_text("Rain all day."),
        ])
        .with_delay(Duration::from_millis(20));
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("Rain".into())));

        let handle = agent.submit(TurnRequest::new("Weather?")).await.unwrap();
        let id = handle.conversation_id.clone();
        drop(handle);

        wait_until_idle(&agent, &id).await;
        let conversation = agent.store().get(&id).await.unwrap();
        let roles: Vec<_> = conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Tool, Role::Assistant]);
        assert_eq!(conversation.messages[2].as_concat_text(), "Rain all day.");
    }

    #[tokio::test]
    async fn test_conversations_run_independently() {
        let provider = MockProvider::new(vec![
            Message::assistant().with_text("one"),
            Message::assistant().with_text("two"),
        ])
        .with_delay(Duration::from_millis(100));
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("unused".into())));

        let first = agent.submit(TurnRequest::new("a")).await.unwrap();
        let second = agent.submit(TurnRequest::new("b")).await.unwrap();
        let (first_id, second_id) = (first.conversation_id.clone(), second.conversation_id.clone());
        assert_ne!(first_id, second_id);
        assert!(agent.is_running(&first_id));
        assert!(agent.is_running(&second_id));

        // Cancelling one conversation leaves the other untouched
        assert!(agent.cancel(&first_id));
        let (first_events, second_events) = tokio::join!(collect(first), collect(second));
        assert!(matches!(first_events.last(), Some(TurnEvent::Cancelled { .. })));
        assert!(matches!(second_events.last(), Some(TurnEvent::Done { .. })));

        let second = agent.store().get(&second_id).await.unwrap();
        assert_eq!(second.messages.len(), 2);
        assert_eq!(agent.store().list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_provider_panic_still_ends_turn() {
        let toolbox = Toolbox::new().with_capability(Arc::new(StubWeather::new(Ok("".into()))));
        let agent = Agent::new(
            Arc::new(PanickingProvider),
            Arc::new(MemoryStore::new()),
            toolbox,
        );

        let handle = agent.submit(TurnRequest::new("Hello")).await.unwrap();
        let id = handle.conversation_id.clone();
        let events = collect(handle).await;

        assert_eq!(kinds(&events), vec!["status", "error"]);
        assert!(!agent.is_running(&id));
        assert_eq!(agent.store().get(&id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_huge_usage_saturates() {
        let provider = MockProvider::new(vec![
            weather_request(),
            Message::assistant().with_text("Done."),
        ])
        .with_usage(Usage::new(u32::MAX - 1, 1, u32::MAX));
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("Sunny".into())));

        let events = collect(agent.submit(TurnRequest::new("Weather?")).await.unwrap()).await;
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Done { usage, .. }) if *usage == Usage::new(u32::MAX, 2, u32::MAX)
        ));
    }

    #[tokio::test]
    async fn test_delete_refused_while_running() {
        let provider = MockProvider::new(vec![Message::assistant().with_text("slow")])
            .with_delay(Duration::from_millis(50));
        let (agent, _) = agent_with(provider, StubWeather::new(Ok("unused".into())));

        let handle = agent.submit(TurnRequest::new("hi")).await.unwrap();
        let id = handle.conversation_id.clone();
        assert!(matches!(
            agent.delete_conversation(&id).await,
            Err(TurnError::Busy(CancelError::AlreadyRunning(_)))
        ));

        collect(handle).await;
        agent.delete_conversation(&id).await.unwrap();
        agent.delete_conversation(&id).await.unwrap();
        assert!(!agent.store().exists(&id).await.unwrap());
        assert!(!agent.is_running(&id));
    }

    #[test]
    fn test_system_prompt_includes_catalog() {
        let (agent, _) = agent_with(MockProvider::new(vec![]), StubWeather::new(Ok("".into())));
        let registry = agent.toolbox.registry(&["weather"]).unwrap();
        let catalog = Catalog::build(&registry).unwrap();

        let prompt = agent.system_prompt(&catalog).unwrap();
        assert!(prompt.contains("- get_weather (Weather): Current weather"));
    }
}
