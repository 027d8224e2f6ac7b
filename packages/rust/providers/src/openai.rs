//! OpenAI-compatible research and embedding clients.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use listscout_budget::ModelPricing;
use listscout_dedup::{EmbeddingBatch, EmbeddingProvider};
use listscout_shared::{Candidate, ProviderConfig, ProviderError, Result};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::{ResearchOutput, ResearchProvider, ResearchRequest, build_client};

/// Upper bound on resources requested per call.
const MAX_RESOURCES: usize = 10;

/// Excluded URLs listed in a prompt; longer lists are cut.
const MAX_PROMPT_EXCLUSIONS: usize = 50;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// One resource as proposed by the model.
#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(default, alias = "name")]
    title: Option<String>,
    #[serde(default, alias = "link")]
    url: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

// ---------------------------------------------------------------------------
// OpenAiResearcher
// ---------------------------------------------------------------------------

/// Research provider backed by `/chat/completions`.
pub struct OpenAiResearcher {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    pricing: ModelPricing,
    topic: String,
}

impl OpenAiResearcher {
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_secs))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.research_model.clone(),
            pricing: ModelPricing::for_model(&config.research_model),
            topic: String::new(),
        })
    }

    /// Subject of the list being extended, mentioned in every prompt.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    fn prompts(&self, request: &ResearchRequest<'_>) -> (String, String) {
        let ResearchRequest { category, query, .. } = *request;
        let domain = if self.topic.is_empty() {
            "software and technology"
        } else {
            self.topic.as_str()
        };
        let system = format!(
            "You are a research assistant finding high-quality resources about {category} \
             in the context of {domain} for a curated awesome list. Only propose resources \
             that exist, are maintained, and have a direct https URL. Descriptions must be \
             under 100 characters. Answer with a JSON object of the form \
             {{\"resources\":[{{\"title\":\"...\",\"url\":\"...\",\"description\":\"...\"}}]}}."
        );

        let mut user = format!("Research: {query}\n");
        if !request.examples.is_empty() {
            user.push_str("\nExisting resources in this category:\n");
            for (i, entry) in request.examples.iter().enumerate() {
                user.push_str(&format!("{}. {}", i + 1, entry.title));
                if !entry.description.is_empty() {
                    user.push_str(&format!(": {}", entry.description));
                }
                user.push_str(&format!(" - {}\n", entry.url));
            }
            user.push_str("Find similar high-quality resources that are not already in the list.\n");
        }
        if !request.exclude_urls.is_empty() {
            user.push_str("\nDo not propose any of these URLs:\n");
            for url in request.exclude_urls.iter().take(MAX_PROMPT_EXCLUSIONS) {
                user.push_str(&format!("- {url}\n"));
            }
        }
        user.push_str(&format!(
            "\nReturn up to {MAX_RESOURCES} resources for the \"{category}\" category."
        ));
        (system, user)
    }
}

#[async_trait]
impl ResearchProvider for OpenAiResearcher {
    #[instrument(skip_all, fields(category = %request.category, model = %self.model))]
    async fn research(
        &self,
        request: &ResearchRequest<'_>,
    ) -> std::result::Result<ResearchOutput, ProviderError> {
        let category = request.category;
        let (system, user) = self.prompts(request);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "response_format": {"type": "json_object"},
        });

        let url = format!("{}/chat/completions", self.base_url);
        let text = post_json(&self.client, &url, &self.api_key, &body).await?;

        let response: ChatResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::MalformedResponse {
                message: format!("invalid chat response: {e}"),
                cost_usd: 0.0,
            })?;

        let usage = response.usage.unwrap_or_default();
        let tokens_used = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        };
        let cost_usd = self
            .pricing
            .cost_usd(usage.prompt_tokens, usage.completion_tokens);

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::MalformedResponse {
                message: "response has no message content".into(),
                cost_usd,
            })?;

        let resources = parse_resources(&content).map_err(|message| {
            ProviderError::MalformedResponse { message, cost_usd }
        })?;

        let candidates: Vec<Candidate> = resources
            .into_iter()
            .filter_map(|r| {
                let title = r.title?.trim().to_string();
                let url = r.url?.trim().to_string();
                if title.is_empty() || !(url.starts_with("http://") || url.starts_with("https://"))
                {
                    return None;
                }
                Some(Candidate {
                    category: category.to_string(),
                    title,
                    url,
                    description: r.description.unwrap_or_default().trim().to_string(),
                    source_tag: self.model.clone(),
                })
            })
            .collect();

        debug!(
            candidates = candidates.len(),
            tokens = tokens_used,
            cost_usd,
            "research call complete"
        );

        Ok(ResearchOutput {
            candidates,
            tokens_used,
            cost_usd,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// OpenAiEmbedder
// ---------------------------------------------------------------------------

/// Embedding provider backed by `/embeddings`. Each batch is one request
/// with an array `input`.
pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    pricing: ModelPricing,
}

impl OpenAiEmbedder {
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_secs))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.embedding_model.clone(),
            pricing: ModelPricing::for_model(&config.embedding_model),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    #[instrument(skip_all, fields(texts = texts.len(), model = %self.model))]
    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<EmbeddingBatch, ProviderError> {
        let body = json!({ "model": self.model, "input": texts });
        let url = format!("{}/embeddings", self.base_url);
        let text = post_json(&self.client, &url, &self.api_key, &body).await?;

        let mut response: EmbeddingResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::MalformedResponse {
                message: format!("invalid embedding response: {e}"),
                cost_usd: 0.0,
            })?;

        let usage = response.usage.unwrap_or_default();
        let tokens_used = usage.prompt_tokens.max(usage.total_tokens);
        let cost_usd = self.pricing.cost_usd(tokens_used, 0);

        if response.data.len() != texts.len() {
            return Err(ProviderError::MalformedResponse {
                message: format!(
                    "embedding response has {} vectors for {} inputs",
                    response.data.len(),
                    texts.len()
                ),
                cost_usd,
            });
        }
        response.data.sort_by_key(|d| d.index);

        debug!(tokens = tokens_used, cost_usd, "embedding call complete");
        Ok(EmbeddingBatch {
            vectors: response.data.into_iter().map(|d| d.embedding).collect(),
            tokens_used,
            cost_usd,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// POST a JSON body and return the response text of a 2xx answer.
async fn post_json(
    client: &Client,
    url: &str,
    api_key: &str,
    body: &Value,
) -> std::result::Result<String, ProviderError> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(body)
        .send()
        .await
        .map_err(map_transport_error)?;

    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    let text = response.text().await.map_err(map_transport_error)?;

    if !status.is_success() {
        return Err(map_http_error(status, retry_after, &text));
    }
    Ok(text)
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Map a non-success status to a provider error.
fn map_http_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let detail = format!("HTTP {status}: {}", truncate(body, 200));
    match status.as_u16() {
        429 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::Unauthorized(detail),
        408 => ProviderError::Timeout,
        500..=599 => ProviderError::Unavailable(detail),
        _ => ProviderError::BadRequest(detail),
    }
}

/// `Retry-After` in (possibly fractional) seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// Response content parsing
// ---------------------------------------------------------------------------

/// Matches `[Name](url)` with an optional ` - description` tail.
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\((https?://[^)\s]+)\)(?:\s*[-:\x{2013}]\s*(.+))?").expect("link regex")
});

/// Extract resources from model output: JSON first, Markdown links second.
fn parse_resources(content: &str) -> std::result::Result<Vec<Resource>, String> {
    let body = strip_code_fence(content);

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("resources") {
                Some(Value::Array(items)) => items,
                _ => map
                    .into_iter()
                    .find_map(|(_, v)| match v {
                        Value::Array(items) => Some(items),
                        _ => None,
                    })
                    .ok_or_else(|| "JSON object has no resource array".to_string())?,
            },
            _ => return Err("JSON answer is neither an object nor an array".into()),
        };
        return Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect());
    }

    let links: Vec<Resource> = body
        .lines()
        .filter_map(|line| LINK_RE.captures(line))
        .map(|caps| Resource {
            title: Some(caps[1].trim().to_string()),
            url: Some(caps[2].trim().to_string()),
            description: caps.get(3).map(|m| m.as_str().trim().to_string()),
        })
        .collect();

    if links.is_empty() {
        Err(format!(
            "answer is neither JSON nor a link list: {}",
            truncate(body, 120)
        ))
    } else {
        Ok(links)
    }
}

/// Remove a surrounding ```json fence, if present.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use listscout_shared::OriginalEntry;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(base_url: &str) -> ProviderConfig {
        ProviderConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            ..ProviderConfig::default()
        }
    }

    fn chat_body(content: &str) -> Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500}
        })
    }

    #[test]
    fn parses_resources_object() {
        let content = r#"{"resources":[{"title":"nextest","url":"https://nexte.st","description":"Test runner"}]}"#;
        let resources = parse_resources(content).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].title.as_deref(), Some("nextest"));
    }

    #[test]
    fn parses_fenced_array_with_name_alias() {
        let content = "```json\n[{\"name\":\"fd\",\"url\":\"https://github.com/sharkdp/fd\"}]\n```";
        let resources = parse_resources(content).unwrap();
        assert_eq!(resources[0].title.as_deref(), Some("fd"));
        assert!(resources[0].description.is_none());
    }

    #[test]
    fn falls_back_to_markdown_links() {
        let content = "Here you go:\n1. [bat](https://github.com/sharkdp/bat) - A cat clone.\n2. [exa](https://the.exa.website)";
        let resources = parse_resources(content).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].description.as_deref(), Some("A cat clone."));
    }

    #[test]
    fn prose_is_rejected() {
        assert!(parse_resources("I could not find anything.").is_err());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_http_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2)), ""),
            ProviderError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            map_http_error(StatusCode::FORBIDDEN, None, ""),
            ProviderError::Unauthorized(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::BAD_GATEWAY, None, ""),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::UNPROCESSABLE_ENTITY, None, ""),
            ProviderError::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn research_returns_candidates_and_cost() {
        let server = MockServer::start().await;
        let content = r#"{"resources":[
            {"title":"nextest","url":"https://nexte.st","description":"Next-gen test runner"},
            {"title":"no url"},
            {"title":"ftp thing","url":"ftp://example.com"}
        ]}"#;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(content)))
            .mount(&server)
            .await;

        let researcher = OpenAiResearcher::new(&config(&server.uri()), "sk-test".into())
            .unwrap()
            .with_topic("Rust");
        let out = researcher
            .research(&ResearchRequest::new("Testing", "rust test runners"))
            .await
            .unwrap();

        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].category, "Testing");
        assert_eq!(out.candidates[0].source_tag, "gpt-4o");
        assert_eq!(out.tokens_used, 1500);
        assert!((out.cost_usd - 0.0125).abs() < 1e-9);
    }

    #[test]
    fn prompt_lists_examples_and_exclusions() {
        let researcher = OpenAiResearcher::new(&config("http://localhost"), "sk-test".into())
            .unwrap()
            .with_topic("Rust");
        let examples = [OriginalEntry {
            category: "Testing".into(),
            title: "nextest".into(),
            url: "https://nexte.st".into(),
            description: "Next-gen test runner".into(),
        }];
        let exclude = vec![
            "https://nexte.st".to_string(),
            "https://github.com/la10736/rstest".to_string(),
        ];
        let request = ResearchRequest {
            examples: &examples,
            exclude_urls: &exclude,
            ..ResearchRequest::new("Testing", "rust test runners")
        };

        let (system, user) = researcher.prompts(&request);
        assert!(system.contains("Testing"));
        assert!(system.contains("Rust"));
        assert!(user.starts_with("Research: rust test runners"));
        assert!(user.contains("1. nextest: Next-gen test runner - https://nexte.st"));
        assert!(user.contains("Do not propose any of these URLs:"));
        assert!(user.contains("- https://github.com/la10736/rstest"));
    }

    #[test]
    fn prompt_without_context_has_no_example_block() {
        let researcher =
            OpenAiResearcher::new(&config("http://localhost"), "sk-test".into()).unwrap();
        let (_, user) = researcher.prompts(&ResearchRequest::new("Testing", "q"));
        assert!(!user.contains("Existing resources"));
        assert!(!user.contains("Do not propose"));
    }

    #[test]
    fn prompt_exclusions_are_capped() {
        let researcher =
            OpenAiResearcher::new(&config("http://localhost"), "sk-test".into()).unwrap();
        let exclude: Vec<String> = (0..80).map(|i| format!("https://example.com/{i}")).collect();
        let request = ResearchRequest {
            exclude_urls: &exclude,
            ..ResearchRequest::new("Testing", "q")
        };
        let (_, user) = researcher.prompts(&request);
        assert!(user.contains("https://example.com/49\n"));
        assert!(!user.contains("https://example.com/50\n"));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let researcher = OpenAiResearcher::new(&config(&server.uri()), "sk-test".into()).unwrap();
        let err = researcher
            .research(&ResearchRequest::new("Testing", "q"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
    }

    #[tokio::test]
    async fn unparsable_answer_is_malformed_with_cost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(chat_body("Sorry, I cannot help.")),
            )
            .mount(&server)
            .await;

        let researcher = OpenAiResearcher::new(&config(&server.uri()), "sk-test".into()).unwrap();
        let err = researcher
            .research(&ResearchRequest::new("Testing", "q"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { .. }));
        assert!(err.cost_usd() > 0.0);
    }

    #[tokio::test]
    async fn embedder_sends_one_batched_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({
                "model": "text-embedding-3-small",
                "input": ["ripgrep fast search", "fd find files"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"embedding": [0.0, 1.0], "index": 1},
                    {"embedding": [1.0, 0.0], "index": 0}
                ],
                "usage": {"prompt_tokens": 50000, "total_tokens": 50000}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::new(&config(&server.uri()), "sk-test".into()).unwrap();
        let batch = embedder
            .embed_batch(&["ripgrep fast search".to_string(), "fd find files".to_string()])
            .await
            .unwrap();

        assert_eq!(batch.vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(batch.tokens_used, 50_000);
        // text-embedding-3-small at $0.00002 per 1K input tokens.
        assert!((batch.cost_usd - 0.001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn embedder_rejects_short_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [1.0], "index": 0}]
            })))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::new(&config(&server.uri()), "sk-test".into()).unwrap();
        let err = embedder
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn embedder_maps_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::new(&config(&server.uri()), "sk-test".into()).unwrap();
        let err = embedder.embed_batch(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
