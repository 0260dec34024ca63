pub mod openrouter;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::stream::DeltaDecoder;

/// A live story completion: the model serving it plus the delta feed.
pub struct StoryStream {
    pub model: String,
    pub deltas: DeltaDecoder,
}

// Seams for the two generation calls a run makes. The pipeline only sees
// these traits; the OpenRouter client implements both.

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Open a streaming completion for a story prompt on the given model.
    async fn open_story_stream(&self, prompt: &str, model: &str) -> Result<StoryStream>;
}

#[async_trait]
pub trait TitleBackend: Send + Sync {
    /// Produce a title for a story excerpt. Single response, not streamed.
    async fn generate_title(&self, excerpt: &str) -> Result<String>;
}
