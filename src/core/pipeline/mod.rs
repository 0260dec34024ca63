use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::core::llm::{CompletionBackend, TitleBackend};
use crate::core::selector::ModelSelector;
use crate::core::store::{NewStory, Story, StoryStore};

/// Shown while the title request is in flight, then erased and replaced by
/// the real title character-by-character.
pub const TITLE_PLACEHOLDER: &str = "Thinking of a title...";

/// How far into the story the title request looks. Bounds the request size;
/// the stored story is never truncated.
const TITLE_EXCERPT_CHARS: usize = 500;

/// The phase a run is in, in order. Transitions are monotonic within a run;
/// `Failed` is reachable from any non-terminal phase; a new run resets to
/// `Idle` first.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelinePhase {
    Idle,
    ErasingPriorInput,
    StreamingStory,
    TitleThinking,
    TitleErasing,
    TitleTyping,
    Persisted(Story),
    Failed(RunFailure),
}

impl PipelinePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelinePhase::Persisted(_) | PipelinePhase::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::ErasingPriorInput => "erasing_prior_input",
            PipelinePhase::StreamingStory => "streaming_story",
            PipelinePhase::TitleThinking => "title_thinking",
            PipelinePhase::TitleErasing => "title_erasing",
            PipelinePhase::TitleTyping => "title_typing",
            PipelinePhase::Persisted(_) => "persisted",
            PipelinePhase::Failed(_) => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureStage {
    Completion,
    Title,
    Persistence,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Completion => "completion",
            FailureStage::Title => "title",
            FailureStage::Persistence => "persistence",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunFailure {
    pub stage: FailureStage,
    pub message: String,
}

/// Everything a renderer needs to draw the current run. Published through a
/// watch channel: consumers always see the latest frame.
#[derive(Clone, Debug)]
pub struct RunView {
    pub phase: PipelinePhase,
    pub input: String,
    pub story: String,
    pub title: String,
}

impl Default for RunView {
    fn default() -> Self {
        Self {
            phase: PipelinePhase::Idle,
            input: String::new(),
            story: String::new(),
            title: String::new(),
        }
    }
}

/// Per-character delays for the cosmetic erase/type phases. Zero delays keep
/// the phase sequence intact while letting tests run instantly.
#[derive(Clone, Copy, Debug)]
pub struct Pacer {
    erase_delay: Duration,
    type_delay: Duration,
}

impl Pacer {
    pub fn new(erase_delay: Duration, type_delay: Duration) -> Self {
        Self {
            erase_delay,
            type_delay,
        }
    }

    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    async fn erase_beat(&self) {
        if !self.erase_delay.is_zero() {
            tokio::time::sleep(self.erase_delay).await;
        }
    }

    async fn type_beat(&self) {
        if !self.type_delay.is_zero() {
            tokio::time::sleep(self.type_delay).await;
        }
    }
}

/// Drives one run end to end: erase prior input, stream the story, fetch a
/// title, persist, publish. At most one run per pipeline is in flight; a
/// submission during a run is rejected, not queued.
pub struct StoryPipeline {
    selector: Arc<ModelSelector>,
    completions: Arc<dyn CompletionBackend>,
    titles: Arc<dyn TitleBackend>,
    store: Arc<StoryStore>,
    pacer: Pacer,
    view_tx: watch::Sender<RunView>,
    running: AtomicBool,
}

impl StoryPipeline {
    pub fn new(
        selector: Arc<ModelSelector>,
        completions: Arc<dyn CompletionBackend>,
        titles: Arc<dyn TitleBackend>,
        store: Arc<StoryStore>,
        pacer: Pacer,
    ) -> Self {
        let (view_tx, _) = watch::channel(RunView::default());
        Self {
            selector,
            completions,
            titles,
            store,
            pacer,
            view_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Current-view feed for renderers. Read-only.
    pub fn subscribe(&self) -> watch::Receiver<RunView> {
        self.view_tx.subscribe()
    }

    pub async fn generate(&self, prompt: &str) -> Result<Story> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            bail!("prompt must not be empty");
        }
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("a story run is already in progress");
        }
        let _guard = RunGuard(&self.running);

        // Reset to Idle, discarding everything from the previous run except
        // the displayed input, which the erase phase consumes.
        let prior_input = self.view_tx.borrow().input.clone();
        self.view_tx.send_replace(RunView {
            input: prior_input,
            ..RunView::default()
        });

        self.set_phase(PipelinePhase::ErasingPriorInput);
        while !self.view_tx.borrow().input.is_empty() {
            self.view_tx.send_modify(|view| {
                view.input.pop();
            });
            self.pacer.erase_beat().await;
        }
        self.view_tx
            .send_modify(|view| view.input = prompt.to_string());

        let model = self.selector.draw().to_string();
        info!("Generating story with model [{}]", model);

        self.set_phase(PipelinePhase::StreamingStory);
        let mut stream = match self.completions.open_story_stream(prompt, &model).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(FailureStage::Completion, e)),
        };
        let served_model = stream.model.clone();
        loop {
            match stream.deltas.next_delta().await {
                Ok(Some(delta)) => {
                    // Committed in arrival order before the next delta is read
                    self.view_tx.send_modify(|view| view.story.push_str(&delta));
                }
                Ok(None) => break,
                Err(e) => return Err(self.fail(FailureStage::Completion, e)),
            }
        }
        let content = self.view_tx.borrow().story.clone();

        self.set_phase(PipelinePhase::TitleThinking);
        self.view_tx
            .send_modify(|view| view.title = TITLE_PLACEHOLDER.to_string());
        let raw_title = match self.titles.generate_title(story_excerpt(&content)).await {
            Ok(title) => title,
            Err(e) => return Err(self.fail(FailureStage::Title, e)),
        };
        let title = strip_title_quotes(&raw_title).to_string();

        self.set_phase(PipelinePhase::TitleErasing);
        while !self.view_tx.borrow().title.is_empty() {
            self.view_tx.send_modify(|view| {
                view.title.pop();
            });
            self.pacer.erase_beat().await;
        }

        self.set_phase(PipelinePhase::TitleTyping);
        for ch in title.chars() {
            self.view_tx.send_modify(|view| view.title.push(ch));
            self.pacer.type_beat().await;
        }

        let story = match self
            .store
            .create(NewStory {
                title,
                content,
                prompt: prompt.to_string(),
                model: served_model,
            })
            .await
        {
            Ok(story) => story,
            Err(e) => return Err(self.fail(FailureStage::Persistence, e)),
        };

        info!("Run finished: story #{}", story.number);
        self.set_phase(PipelinePhase::Persisted(story.clone()));
        Ok(story)
    }

    fn set_phase(&self, phase: PipelinePhase) {
        self.view_tx.send_modify(|view| view.phase = phase);
    }

    fn fail(&self, stage: FailureStage, err: anyhow::Error) -> anyhow::Error {
        let failure = RunFailure {
            stage,
            message: format!("{err:#}"),
        };
        warn!("Run failed during {}: {}", stage.as_str(), failure.message);
        self.set_phase(PipelinePhase::Failed(failure));
        err.context(format!("story {} failed", stage.as_str()))
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// First ~500 characters of the story, respecting char boundaries.
pub fn story_excerpt(content: &str) -> &str {
    match content.char_indices().nth(TITLE_EXCERPT_CHARS) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

/// Titles often come back wrapped in quotes; drop one layer.
pub fn strip_title_quotes(raw: &str) -> &str {
    let title = raw.trim();
    let title = title.strip_prefix(['"', '\'']).unwrap_or(title);
    title.strip_suffix(['"', '\'']).unwrap_or(title)
}
