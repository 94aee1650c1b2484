//! Language-model capabilities over an OpenAI-compatible chat completions API.
//!
//! [`ChatClient`] does the HTTP; [`LlmExtractor`], [`LlmSummarizer`] and
//! [`LlmWriter`] each own a model and a prompt shape.

use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use varnika_crawler::{ContentExtractor, RawPage};
use varnika_gate::http::{check_status, classify_send_error};
use varnika_shared::UpstreamError;

const EXTRACTION_PROMPT: &str = "You extract the information from a web page that is relevant to a \
query. Reply with a plain-text summary of the relevant facts only. Do not invent anything that is \
not on the page.";

const SUMMARIZER_PROMPT: &str = "You are a technical writer who creates detailed, LLM-readable \
summaries of the given information without hallucination.";

const WRITER_PROMPT: &str = "You are an AI that imitates a writing style (without including any \
info from it) to write nonredundantly about the context provided, WITH NO HALLUCINATION. NEVER USE \
BOLD FORMATTING";

/// Capability: condense aggregated page content.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, context: &str) -> Result<String, UpstreamError>;
}

/// Capability: write an article from context in the style of a sample.
#[async_trait]
pub trait ArticleWriter: Send + Sync {
    async fn write(
        &self,
        style: &str,
        context: &str,
        instruction: &str,
    ) -> Result<String, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// ChatClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    endpoint: String,
    api_key: String,
    temperature: f32,
}

impl ChatClient {
    /// `base_url` is the API root, e.g. `https://openrouter.ai/api/v1`.
    pub fn new(client: Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            temperature: 0.3,
        }
    }

    /// Send one chat completion and return the first choice's text.
    #[instrument(skip_all, fields(model = %model))]
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, UpstreamError> {
        let body = ChatRequest {
            model,
            messages,
            temperature: self.temperature,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;
        let response = check_status(response)?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Failed(format!("invalid completion response: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::Failed("completion returned no choices".into()))?;

        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            let reason = choice.finish_reason.unwrap_or_else(|| "unknown".into());
            return Err(UpstreamError::Failed(format!(
                "completion was empty (finish reason: {reason})"
            )));
        }
        debug!(chars = content.len(), "completion received");
        Ok(content.trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Extracts query-relevant content from a fetched page.
#[derive(Debug, Clone)]
pub struct LlmExtractor {
    chat: ChatClient,
    model: String,
}

impl LlmExtractor {
    pub fn new(chat: ChatClient, model: impl Into<String>) -> Self {
        Self {
            chat,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ContentExtractor for LlmExtractor {
    async fn extract(&self, page: &RawPage, query: &str) -> Result<String, UpstreamError> {
        let mut prompt = format!("Query: {query}\nURL: {}\n", page.url);
        if let Some(title) = &page.title {
            prompt.push_str(&format!("Title: {title}\n"));
        }
        prompt.push_str("\nPage content:\n");
        prompt.push_str(&page.text);

        self.chat
            .complete(
                &self.model,
                &[ChatMessage::system(EXTRACTION_PROMPT), ChatMessage::user(prompt)],
            )
            .await
    }
}

#[derive(Debug, Clone)]
pub struct LlmSummarizer {
    chat: ChatClient,
    model: String,
}

impl LlmSummarizer {
    pub fn new(chat: ChatClient, model: impl Into<String>) -> Self {
        Self {
            chat,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, context: &str) -> Result<String, UpstreamError> {
        let prompt = format!(
            "Summarize the following data as text. Reply with only a clear, detailed summary in \
             points, with no JSON.\n\n{context}"
        );
        self.chat
            .complete(
                &self.model,
                &[ChatMessage::system(SUMMARIZER_PROMPT), ChatMessage::user(prompt)],
            )
            .await
    }
}

#[derive(Debug, Clone)]
pub struct LlmWriter {
    chat: ChatClient,
    model: String,
}

impl LlmWriter {
    pub fn new(chat: ChatClient, model: impl Into<String>) -> Self {
        Self {
            chat,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ArticleWriter for LlmWriter {
    async fn write(
        &self,
        style: &str,
        context: &str,
        instruction: &str,
    ) -> Result<String, UpstreamError> {
        let now = Local::now();
        let prompt = format!(
            "Current Date and Time: {}, {}\nWriting Style Example: {style}\nContext: {context}\nUser Query: {instruction}",
            now.format("%Y-%m-%d"),
            now.format("%H:%M:%S"),
        );
        self.chat
            .complete(
                &self.model,
                &[ChatMessage::system(WRITER_PROMPT), ChatMessage::user(prompt)],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn completion(text: &str) -> serde_json::Value {
        json!({
            "id": "cmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }]
        })
    }

    fn chat(server: &MockServer) -> ChatClient {
        let client =
            varnika_gate::http::build_client("varnika-test", Duration::from_secs(5)).expect("client");
        ChatClient::new(client, &format!("{}/api/v1/", server.uri()), "test-key")
    }

    #[tokio::test]
    async fn complete_sends_bearer_and_reads_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_string_contains("\"model\":\"m-1\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("  hello  ")))
            .expect(1)
            .mount(&server)
            .await;

        let text = chat(&server)
            .complete("m-1", &[ChatMessage::user("hi")])
            .await
            .expect("complete");
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn complete_maps_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("empty"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("blank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("   ")))
            .mount(&server)
            .await;

        let client = chat(&server);
        let limited = client
            .complete("m", &[ChatMessage::user("limited")])
            .await
            .unwrap_err();
        assert_eq!(
            limited,
            UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );

        for prompt in ["empty", "blank"] {
            let err = client
                .complete("m", &[ChatMessage::user(prompt)])
                .await
                .unwrap_err();
            assert!(matches!(err, UpstreamError::Failed(_)), "{prompt}: {err:?}");
        }
    }

    #[tokio::test]
    async fn writer_uses_style_prompt_and_instruction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("NEVER USE BOLD FORMATTING"))
            .and(body_string_contains("Writing Style Example: Plain and short."))
            .and(body_string_contains("User Query: Write an article in bullet points"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("- point")))
            .expect(1)
            .mount(&server)
            .await;

        let writer = LlmWriter::new(chat(&server), "writer-model");
        let article = writer
            .write(
                "Plain and short.",
                "qubits",
                "Write an article in bullet points based on the provided context",
            )
            .await
            .expect("write");
        assert_eq!(article, "- point");
    }

    #[tokio::test]
    async fn extractor_includes_query_and_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Query: quantum computing"))
            .and(body_string_contains("Title: Qubits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("relevant facts")))
            .mount(&server)
            .await;

        let extractor = LlmExtractor::new(chat(&server), "extract-model");
        let page = RawPage {
            url: "https://a.example/".into(),
            title: Some("Qubits".into()),
            text: "A qubit is...".into(),
            content_hash: String::new(),
        };
        let summary = extractor
            .extract(&page, "quantum computing")
            .await
            .expect("extract");
        assert_eq!(summary, "relevant facts");
    }
}
