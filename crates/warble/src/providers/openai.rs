use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource};
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{stream_from_complete, Provider, ProviderDelta, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    build_chat_payload, check_openai_context_length_error, openai_response_to_message,
    parse_usage, ToolCallAccumulator,
};
use crate::models::message::Message;
use crate::models::tool::Tool;

const STREAM_DONE: &str = "[DONE]";

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn payload(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        stream: bool,
    ) -> Result<Value> {
        let mut payload = build_chat_payload(
            &self.config.model,
            system,
            messages,
            tools,
            self.config.temperature,
            self.config.max_tokens,
        )?;
        if stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({"include_usage": true});
        }
        Ok(payload)
    }

    fn request(&self, payload: &Value) -> RequestBuilder {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let request = self.client.post(&url).json(payload);
        if self.config.api_key.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Bearer {}", self.config.api_key))
        }
    }

    async fn send(&self, payload: &Value) -> Result<Response> {
        let response = self.request(payload).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response),
            status => Err(Self::status_error(status, response).await),
        }
    }

    async fn status_error(status: StatusCode, response: Response) -> anyhow::Error {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            anyhow!("Server error: {}", status)
        } else {
            let body = response.text().await.unwrap_or_default();
            anyhow!("Request failed: {}\n{}", status, body)
        }
    }

    /// Map a failed event source to the same errors a plain request reports.
    /// `None` means the server closed the stream.
    async fn stream_error(err: EventSourceError) -> Option<anyhow::Error> {
        match err {
            EventSourceError::StreamEnded => None,
            EventSourceError::InvalidStatusCode(status, response) => {
                Some(Self::status_error(status, response).await)
            }
            other => Some(anyhow!("Stream failed: {}", other)),
        }
    }

    fn check_error(data: &Value) -> Result<()> {
        // Raise specific error if context length is exceeded
        if let Some(error) = data.get("error").filter(|e| !e.is_null()) {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err.into());
            }
            return Err(anyhow!("OpenAI API error: {}", error));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage)> {
        let payload = self.payload(system, messages, tools, false)?;
        let response: Value = self.send(&payload).await?.json().await?;
        Self::check_error(&response)?;

        let usage = parse_usage(&response).unwrap_or_default();
        let message = openai_response_to_message(response)?;
        Ok((message, usage))
    }

    fn stream<'a>(
        &'a self,
        system: &'a str,
        messages: &'a [Message],
        tools: &'a [Tool],
    ) -> BoxStream<'a, Result<ProviderDelta>> {
        if !self.config.stream {
            return stream_from_complete(self, system, messages, tools);
        }

        Box::pin(async_stream::try_stream! {
            let payload = self.payload(system, messages, tools, true)?;
            let mut events = EventSource::new(self.request(&payload))
                .map_err(|_| anyhow!("Streaming request body cannot be replayed"))?;

            let mut tool_calls = ToolCallAccumulator::default();
            let mut usage = Usage::default();
            let mut finished = false;

            while let Some(event) = events.next().await {
                let message = match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => message,
                    Err(err) => {
                        // Closing stops the source from reconnecting
                        events.close();
                        if let Some(err) = Self::stream_error(err).await {
                            Err::<(), _>(err)?;
                        }
                        break;
                    }
                };

                if message.data == STREAM_DONE {
                    finished = true;
                    events.close();
                    break;
                }
                let value: Value = serde_json::from_str(&message.data)?;
                Self::check_error(&value)?;

                let delta = &value["choices"][0]["delta"];
                if let Some(text) = delta["content"].as_str() {
                    if !text.is_empty() {
                        yield ProviderDelta::Text(text.to_string());
                    }
                }
                if let Some(fragments) = delta["tool_calls"].as_array() {
                    tool_calls.push(fragments);
                }
                if let Some(reported) = parse_usage(&value) {
                    usage = reported;
                }
            }

            if !finished {
                tracing::debug!("stream closed without a [DONE] marker");
            }
            for request in tool_calls.finish() {
                yield ProviderDelta::ToolRequest(request);
            }
            yield ProviderDelta::Usage(usage);
        })
    }
}
