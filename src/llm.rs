//! Question generation through a hosted chat-completion model

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::quiz::{DueItem, QuestionDraft};
use crate::records::{FamilyMember, KnowledgeItem};

const SYSTEM_PROMPT: &str = concat!(
    "You are generating gentle quiz questions for dementia care. ",
    "Use ONLY provided facts. Respond with JSON matching the schema: ",
    r#"{"questions":[{"question_type":"mcq|recall|photo_identity|true_false","#,
    r#""prompt":"string","options":["string"...],"correct_answer":"string|number|boolean","#,
    r#""item_type":"knowledge|family","item_id":"uuid","difficulty":1,"#,
    r#""acceptable_answers":["string"...]}]}"#,
);

/// Facts handed to the generator
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub patient_name: String,
    pub family_members: Vec<FamilyMember>,

    /// Only the knowledge items the quiz may use
    pub knowledge_items: Vec<KnowledgeItem>,

    pub due_items: Vec<DueItem>,
    pub n: usize,
}

/// Produces quiz questions from patient facts
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<QuestionDraft>>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Azure OpenAI chat-completions client
pub struct AzureOpenAiGenerator {
    config: LlmConfig,
    client: Client,
}

impl AzureOpenAiGenerator {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.deployment,
            self.config.api_version
        )
    }

    /// Send a request with retry logic
    async fn send_request(&self, body: &ChatCompletionsRequest<'_>) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                tokio::time::sleep(delay).await;
            }

            match self.try_request(body).await {
                Ok(content) => return Ok(content),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retryable(e)) => {
                    if attempt < self.config.max_retries {
                        tracing::warn!(
                            "Question generation failed (attempt {}/{}): {}, retrying...",
                            attempt + 1,
                            self.config.max_retries + 1,
                            e
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::llm("All retry attempts failed")))
    }

    async fn try_request(
        &self,
        body: &ChatCompletionsRequest<'_>,
    ) -> std::result::Result<String, Attempt> {
        let response = self
            .client
            .post(self.completions_url())
            .header("api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Attempt::Retryable(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = Error::llm(format!("API error ({}): {}", status, text));
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                Attempt::Retryable(err)
            } else {
                Attempt::Fatal(err)
            });
        }

        let parsed: ChatCompletionsResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(Error::llm(format!("Unreadable response: {}", e))))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Attempt::Fatal(Error::llm("No content in response")))
    }
}

enum Attempt {
    Retryable(Error),
    Fatal(Error),
}

#[async_trait]
impl QuestionGenerator for AzureOpenAiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<QuestionDraft>> {
        let user_content = json!({
            "patient": { "full_name": request.patient_name },
            "family_members": request.family_members,
            "knowledge_items": request.knowledge_items,
            "due_items": request.due_items,
            "n": request.n,
        });

        let body = ChatCompletionsRequest {
            model: &self.config.deployment,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_content.to_string(),
                },
            ],
            temperature: 0.2,
            max_tokens: 1200,
        };

        let content = self.send_request(&body).await?;
        parse_questions(&content)
    }
}

/// Parse the model's `{"questions": [...]}` reply, dropping malformed entries
pub fn parse_questions(content: &str) -> Result<Vec<QuestionDraft>> {
    let value: serde_json::Value = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| Error::llm(format!("Response is not JSON: {}", e)))?;

    let Some(raw) = value.get("questions").and_then(|q| q.as_array()) else {
        return Ok(Vec::new());
    };

    let mut questions = Vec::with_capacity(raw.len());
    for entry in raw {
        match serde_json::from_value::<QuestionDraft>(entry.clone()) {
            Ok(q) if !q.prompt.trim().is_empty() => questions.push(q),
            Ok(_) => tracing::warn!("Dropping generated question with empty prompt"),
            Err(e) => tracing::warn!("Dropping malformed generated question: {}", e),
        }
    }
    Ok(questions)
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
