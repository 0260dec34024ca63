use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{CompletionBackend, StoryStream, TitleBackend};
use crate::config::Config;
use crate::core::stream::DeltaDecoder;

const STORY_SYSTEM_PROMPT: &str = "You are a creative writer who crafts short, \
engaging stories from user prompts. Use line breaks to separate paragraphs.";

const TITLE_SYSTEM_PROMPT: &str =
    "You are a creative writer who invents short, catchy titles for stories.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Deserialize)]
struct ChatMessageOwned {
    content: String,
}

/// Chat-completions client for an OpenRouter-compatible endpoint. Carries the
/// attribution headers the provider expects alongside the Bearer credential.
pub struct OpenRouterClient {
    client: Client,
    completions_url: String,
    api_key: String,
    site_url: String,
    site_name: String,
    title_model: String,
}

impl OpenRouterClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            completions_url: config.completions_url.clone(),
            api_key: config.api_key.clone(),
            site_url: config.site_url.clone(),
            site_name: config.site_name.clone(),
            title_model: config.title_model.clone(),
        }
    }

    fn post_chat(&self, req: &ChatRequest<'_>) -> reqwest::RequestBuilder {
        self.client
            .post(&self.completions_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.site_url)
            .header("X-Title", &self.site_name)
            .json(req)
    }
}

#[async_trait]
impl CompletionBackend for OpenRouterClient {
    async fn open_story_stream(&self, prompt: &str, model: &str) -> Result<StoryStream> {
        let user_prompt = format!(
            "Write an entertaining story about: {prompt}\n\nDon't forget some humor. \
             Reply with the story only, no explanations or commentary."
        );
        let req = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: STORY_SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            stream: Some(true),
            max_tokens: 2000,
        };

        let res = self.post_chat(&req).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(anyhow!(
                "story provider returned {}: {}",
                status,
                res.text().await.unwrap_or_default()
            ));
        }

        Ok(StoryStream {
            model: model.to_string(),
            deltas: DeltaDecoder::from_response(res),
        })
    }
}

#[async_trait]
impl TitleBackend for OpenRouterClient {
    async fn generate_title(&self, excerpt: &str) -> Result<String> {
        let user_prompt = format!(
            "Come up with a short, catchy title for the following story. Reply with \
             the title only, no explanations, no alternatives: {excerpt}..."
        );
        let req = ChatRequest {
            model: &self.title_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: TITLE_SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            stream: None,
            max_tokens: 30,
        };

        let res = self.post_chat(&req).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(anyhow!(
                "title provider returned {}: {}",
                status,
                res.text().await.unwrap_or_default()
            ));
        }

        let parsed: ChatResponse = res.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }
}
