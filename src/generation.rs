use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{Resequencer, StreamBuffer};
use crate::compose;
use crate::error::{EngineError, ProviderError};
use crate::llm::CompletionRequest;
use crate::models::{ChunkData, ProgressUpdate, SessionState, Stage, StreamEvent};
use crate::registry::PoolMember;
use crate::retry::{Decision, RetryPolicy};

const TITLE_END: u8 = 40;
const TITLE_CAP: u8 = 38;
const CONTENT_SPAN: usize = 55;
const TITLE_EXPECTED_CHARS: usize = 30;

fn default_style() -> String {
    compose::DEFAULT_STYLE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub length: Option<u32>,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            title: None,
            style: default_style(),
            provider: None,
            model: None,
            length: None,
        }
    }

    fn supplied_title(&self) -> Option<&str> {
        self.title.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedContent {
    pub title: String,
    pub content: String,
    pub summary: String,
    pub word_count: usize,
    pub provider: String,
    pub model: String,
}

#[derive(Debug)]
pub enum SessionOutcome {
    Complete(GeneratedContent),
    Failed(EngineError),
    Cancelled,
}

enum StageOutcome {
    Done(String),
    Failed(EngineError),
    Cancelled,
}

enum Attempt {
    Done,
    Failed(ProviderError),
    Cancelled,
}

/// One in-flight generation: title stage, then content stage, streamed into a shared buffer.
pub struct GenerationSession {
    id: String,
    request: GenerationRequest,
    provider: PoolMember,
    model: String,
    policy: RetryPolicy,
    buffer: StreamBuffer,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<StreamEvent>,
    state: SessionState,
    progress: u8,
    stage_chars: usize,
}

impl GenerationSession {
    pub fn new(
        id: String,
        request: GenerationRequest,
        provider: PoolMember,
        policy: RetryPolicy,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let model = request.model.clone().unwrap_or_else(|| provider.model.clone());
        Self {
            id,
            request,
            provider,
            model,
            policy,
            buffer: StreamBuffer::new(),
            cancel: CancellationToken::new(),
            events,
            state: SessionState::Idle,
            progress: 0,
            stage_chars: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn buffer(&self) -> StreamBuffer {
        self.buffer.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Drive the session to a terminal state. The buffer is closed on return.
    pub async fn run(&mut self) -> SessionOutcome {
        info!(
            session = %self.id,
            provider = %self.provider.name,
            model = %self.model,
            topic = %self.request.topic,
            "generation started"
        );
        let outcome = self.drive().await;
        self.buffer.close();
        match &outcome {
            SessionOutcome::Complete(content) => {
                info!(session = %self.id, words = content.word_count, "generation complete")
            }
            SessionOutcome::Failed(e) => warn!(session = %self.id, error = %e, "generation failed"),
            SessionOutcome::Cancelled => info!(session = %self.id, "generation cancelled"),
        }
        outcome
    }

    async fn drive(&mut self) -> SessionOutcome {
        let title = match self.request.supplied_title().map(str::to_string) {
            Some(title) => {
                self.buffer.append(&title);
                self.buffer.append("\n\n");
                self.progress = TITLE_END;
                title
            }
            None => {
                self.transition(SessionState::GeneratingTitle);
                let request = compose::title_request(&self.model, &self.request.topic, &self.request.style);
                let raw = match self.run_stage(Stage::Title, &request).await {
                    StageOutcome::Done(raw) => raw,
                    StageOutcome::Failed(e) => return self.fail(e),
                    StageOutcome::Cancelled => return self.cancelled(),
                };
                let title = compose::clean_title(&raw);
                let title = if title.is_empty() {
                    warn!(session = %self.id, "model returned an empty title, using the topic");
                    self.request.topic.trim().to_string()
                } else {
                    title
                };
                self.buffer.append("\n\n");
                self.raise_progress(TITLE_END);
                title
            }
        };

        self.transition(SessionState::GeneratingContent);
        let length = self.request.length.unwrap_or(compose::DEFAULT_LENGTH);
        let request = compose::content_request(
            &self.model,
            &self.request.topic,
            &title,
            &self.request.style,
            length,
        );
        let content = match self.run_stage(Stage::Content, &request).await {
            StageOutcome::Done(content) => content.trim().to_string(),
            StageOutcome::Failed(e) => return self.fail(e),
            StageOutcome::Cancelled => return self.cancelled(),
        };

        self.progress = 100;
        self.transition(SessionState::Complete);
        SessionOutcome::Complete(GeneratedContent {
            summary: compose::summarize(&content),
            word_count: compose::word_count(&content),
            title,
            content,
            provider: self.provider.name.clone(),
            model: self.model.clone(),
        })
    }

    /// Stream one stage, retrying under the policy. A retry starts over from the stage mark.
    async fn run_stage(&mut self, stage: Stage, request: &CompletionRequest) -> StageOutcome {
        let mark = self.buffer.len();
        self.stage_chars = 0;
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }
            match self.stream_once(stage, request).await {
                Attempt::Done => return StageOutcome::Done(self.buffer.slice_from(mark)),
                Attempt::Cancelled => return StageOutcome::Cancelled,
                Attempt::Failed(err) => match self.policy.decide(&self.provider.name, attempt, err) {
                    Decision::Surface(e) => return StageOutcome::Failed(e),
                    Decision::Retry(delay) => {
                        self.buffer.truncate(mark);
                        self.stage_chars = 0;
                        let cancel = self.cancel.clone();
                        tokio::select! {
                            _ = cancel.cancelled() => return StageOutcome::Cancelled,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
            attempt += 1;
        }
    }

    async fn stream_once(&mut self, stage: Stage, request: &CompletionRequest) -> Attempt {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = self.provider.client.clone();
        let cancel = self.cancel.clone();
        let call = client.stream(request, tx);
        tokio::pin!(call);

        let mut resequencer = Resequencer::new();
        let mut result = None;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Attempt::Cancelled,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if cancel.is_cancelled() {
                            return Attempt::Cancelled;
                        }
                        if let Some(text) = resequencer.push(frame) {
                            self.accept(stage, &text);
                        }
                    }
                    None => break,
                },
                outcome = &mut call, if result.is_none() => result = Some(outcome),
            }
        }

        let result = match result {
            Some(result) => result,
            None => tokio::select! {
                _ = cancel.cancelled() => return Attempt::Cancelled,
                outcome = &mut call => outcome,
            },
        };

        match result {
            Ok(usage) => {
                if let Some(text) = resequencer.flush() {
                    self.accept(stage, &text);
                }
                debug!(session = %self.id, ?stage, ?usage, "stage stream finished");
                Attempt::Done
            }
            Err(err) => Attempt::Failed(err),
        }
    }

    fn accept(&mut self, stage: Stage, text: &str) {
        self.buffer.append(text);
        self.emit(StreamEvent::Chunk(ChunkData {
            stage,
            text: text.to_string(),
        }));

        self.stage_chars += text.chars().count();
        let progress = match stage {
            Stage::Title => (self.stage_chars * usize::from(TITLE_CAP) / TITLE_EXPECTED_CHARS).min(usize::from(TITLE_CAP)),
            Stage::Content => {
                let target = self.request.length.unwrap_or(compose::DEFAULT_LENGTH).max(1) as usize;
                usize::from(TITLE_END) + (self.stage_chars * CONTENT_SPAN / target).min(CONTENT_SPAN)
            }
        };
        self.raise_progress(u8::try_from(progress).unwrap_or(99));
    }

    /// Progress never goes backwards, including across a retry reset.
    fn raise_progress(&mut self, progress: u8) {
        if progress > self.progress {
            self.progress = progress;
            self.emit_progress();
        }
    }

    fn transition(&mut self, state: SessionState) {
        debug!(session = %self.id, from = ?self.state, to = ?state, "session state change");
        self.state = state;
        self.emit_progress();
    }

    fn fail(&mut self, e: EngineError) -> SessionOutcome {
        self.state = SessionState::Error;
        SessionOutcome::Failed(e)
    }

    fn cancelled(&mut self) -> SessionOutcome {
        self.transition(SessionState::Cancelled);
        SessionOutcome::Cancelled
    }

    fn emit_progress(&mut self) {
        self.emit(StreamEvent::Progress(ProgressUpdate {
            session_id: self.id.clone(),
            state: self.state,
            stage: self.state.stage(),
            progress: self.progress,
        }));
    }

    fn emit(&mut self, event: StreamEvent) {
        if self.events.send(event).is_err() && !self.cancel.is_cancelled() {
            info!(session = %self.id, "event receiver dropped, cancelling session");
            self.cancel.cancel();
        }
    }
}
