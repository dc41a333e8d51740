use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::auth::Token;
use crate::config::ModelConfig;
use crate::error::{CallError, Result, TriageError};
use crate::retry::RetryPolicy;
use crate::triage::Diagnosis;

use super::parse::parse_diagnosis;
use super::prompt::DiagnosticRequest;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct ModelClient {
    client: reqwest::Client,
    url: String,
    model_id: String,
    api_key: Option<Token>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    json_mode: bool,
    retry: RetryPolicy,
}

impl ModelClient {
    /// `attempt_timeout` bounds every single attempt, body included.
    pub fn new(
        config: &ModelConfig,
        api_key: Option<Token>,
        attempt_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("citriage/", env!("CARGO_PKG_VERSION")))
            .timeout(attempt_timeout)
            .build()
            .map_err(|e| TriageError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            model_id: config.id.clone(),
            api_key,
            max_tokens: config.max_response_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            json_mode: config.json_mode,
            retry,
        })
    }

    async fn complete_once(&self, body: &ChatRequest<'_>) -> std::result::Result<String, CallError> {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(CallError::from_status(status.as_u16(), &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(CallError::Decode("model returned an empty response".to_string()));
        }
        Ok(content)
    }

    /// Sends the request and turns the answer into a [`Diagnosis`].
    ///
    /// Throttling, 5xx and timeouts are retried per the retry policy; any
    /// other failure, or running out of attempts, is a `ModelError`.
    pub async fn invoke(&self, request: &DiagnosticRequest) -> Result<Diagnosis> {
        let user_prompt = request.user_prompt();
        let body = ChatRequest {
            model: &self.model_id,
            messages: vec![
                Message {
                    role: "system",
                    content: request.system,
                },
                Message {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            stream: false,
            response_format: self.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };
        let body = &body;

        info!(
            "Invoking model {} with {} prompt characters",
            self.model_id,
            user_prompt.chars().count()
        );

        let content = self
            .retry
            .run(
                "model invocation",
                move |attempt| {
                    debug!("POST {} (attempt {attempt})", self.url);
                    self.complete_once(body)
                },
                CallError::is_transient,
            )
            .await
            .map_err(|failure| TriageError::Model {
                run: request.run.clone(),
                attempts: failure.attempts,
                source: failure.error,
            })?;

        let parsed = parse_diagnosis(&content);
        debug!(
            "Model classified failure as {:?} with {:?} confidence",
            parsed.category, parsed.confidence
        );

        Ok(Diagnosis {
            summary: parsed.summary,
            category: parsed.category,
            confidence: parsed.confidence,
            remediation: parsed.remediation,
            partial: request.truncated,
            run: request.run.clone(),
            job: request.job.clone(),
            model: self.model_id.clone(),
            generated_at: Utc::now(),
        })
    }
}
