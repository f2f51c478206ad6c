use super::{Presentation, Slide, SlideLayout, Source};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretBox};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Slides in every generated deck
pub const SLIDE_COUNT: usize = 6;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DECK_MODEL: &str = "gemini-2.5-flash";
const IMAGE_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Response parsing error: {0}")]
    ParseError(String),
    #[error("No image in response")]
    NoImage,
}

/// Builds a presentation outline for a topic.
#[async_trait]
pub trait DeckGenerator: Send + Sync {
    async fn generate(&self, topic: &str) -> Result<Presentation, GenerationError>;
}

/// Renders one image for a prompt, returned as a data URL.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn render(&self, prompt: &str) -> Result<String, GenerationError>;
}

struct GeminiClient {
    client: Client,
    api_key: SecretBox<String>,
    base_url: String,
}

impl GeminiClient {
    fn new(api_key: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: SecretBox::new(Box::new(api_key.to_string())),
            base_url: BASE_URL.to_string(),
        })
    }

    async fn generate_content(&self, model: &str, payload: &Value) -> Result<Value, GenerationError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GenerationError::ApiError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        Ok(response.json().await?)
    }
}

/// Deck outlines from the Gemini REST API, grounded with web search
pub struct GeminiDeckGenerator {
    inner: GeminiClient,
    model: String,
}

impl GeminiDeckGenerator {
    pub fn new(api_key: &str) -> Result<Self, GenerationError> {
        Ok(Self {
            // Grounded generation can be slow
            inner: GeminiClient::new(api_key, Duration::from_secs(120))?,
            model: DECK_MODEL.to_string(),
        })
    }

    fn prompt(topic: &str) -> String {
        format!(
            "Create a presentation about: {topic}\n\
             Respond with JSON only, no prose, shaped as \
             {{\"title\": string, \"slides\": [{{\"layout\": one of TITLE|CONTENT|TWO_COLUMN|IMAGE_TEXT|QUOTE, \
             \"title\": string, \"subtitle\": string or null, \"content\": [string], \"image_prompt\": string}}]}}.\n\
             Use exactly {SLIDE_COUNT} slides. The first slide uses the TITLE layout."
        )
    }
}

#[async_trait]
impl DeckGenerator for GeminiDeckGenerator {
    async fn generate(&self, topic: &str) -> Result<Presentation, GenerationError> {
        log::info!("Generating deck for topic: {}", topic);
        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": Self::prompt(topic)}]}],
            "tools": [{"googleSearch": {}}]
        });
        let response = self.inner.generate_content(&self.model, &payload).await?;
        parse_deck_response(&response)
    }
}

/// Slide images from the Gemini image model
pub struct GeminiImageGenerator {
    inner: GeminiClient,
    model: String,
}

impl GeminiImageGenerator {
    pub fn new(api_key: &str) -> Result<Self, GenerationError> {
        Ok(Self {
            inner: GeminiClient::new(api_key, Duration::from_secs(60))?,
            model: IMAGE_MODEL.to_string(),
        })
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageGenerator {
    async fn render(&self, prompt: &str) -> Result<String, GenerationError> {
        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {"responseModalities": ["IMAGE"]}
        });
        let response = self.inner.generate_content(&self.model, &payload).await?;
        parse_image_response(&response)
    }
}

#[derive(Deserialize)]
struct RawDeck {
    title: String,
    #[serde(default)]
    slides: Vec<RawSlide>,
}

#[derive(Deserialize)]
struct RawSlide {
    #[serde(default)]
    layout: String,
    #[serde(default)]
    title: String,
    subtitle: Option<String>,
    #[serde(default)]
    content: Vec<String>,
    image_prompt: Option<String>,
}

/// Extract the deck JSON and grounding citations from a response.
pub fn parse_deck_response(response: &Value) -> Result<Presentation, GenerationError> {
    let candidate = &response["candidates"][0];
    let text: String = candidate["content"]["parts"]
        .as_array()
        .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(GenerationError::ParseError("Empty response".to_string()));
    }

    let raw: RawDeck = serde_json::from_str(strip_code_fence(&text))
        .map_err(|e| GenerationError::ParseError(format!("Invalid deck JSON: {}", e)))?;

    let slides = raw
        .slides
        .into_iter()
        .map(|s| Slide {
            layout: SlideLayout::from_str(s.layout.trim()).unwrap_or(SlideLayout::Content),
            title: s.title,
            subtitle: s.subtitle.filter(|t| !t.is_empty()),
            content: s.content,
            image_prompt: s.image_prompt.filter(|p| !p.is_empty()),
            image: None,
        })
        .collect();

    let mut deck = Presentation {
        title: raw.title,
        slides,
        current_slide: 0,
        sources: Vec::new(),
    };

    if let Some(chunks) = candidate["groundingMetadata"]["groundingChunks"].as_array() {
        deck.add_sources(chunks.iter().filter_map(|chunk| {
            let web = &chunk["web"];
            let uri = web["uri"].as_str()?;
            Some(Source {
                title: web["title"].as_str().unwrap_or(uri).to_string(),
                uri: uri.to_string(),
            })
        }));
    }

    deck.normalize(SLIDE_COUNT);
    Ok(deck)
}

/// Return the first inline image as a data URL.
pub fn parse_image_response(response: &Value) -> Result<String, GenerationError> {
    let parts = response["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or(GenerationError::NoImage)?;
    parts
        .iter()
        .find_map(|part| {
            let inline = part.get("inlineData")?;
            let data = inline["data"].as_str()?;
            let mime = inline["mimeType"].as_str().unwrap_or("image/png");
            Some(format!("data:{};base64,{}", mime, data))
        })
        .ok_or(GenerationError::NoImage)
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
