use super::assembler::{Assembler, AssemblerUpdate, TurnOutcome};
use super::cache::DataCache;
use crate::api::{ApiClient, BackendClient};
use crate::config::Config;
use crate::context::ContextBuilder;
use crate::types::{ContextBlock, Viewer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DATA_UNAVAILABLE_NOTICE: &str = "Store data is currently unavailable.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

/// One row of the chat transcript as the view should display it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub author: Author,
    pub text: String,
    pub status: EntryStatus,
}

impl ChatEntry {
    fn new(author: Author, text: impl Into<String>, status: EntryStatus) -> Self {
        Self {
            author,
            text: text.into(),
            status,
        }
    }
}

/// A chat turn that has been registered with the session but not yet sent.
///
/// `run` may be moved onto another task; the session keeps only the turn's
/// cancellation token.
pub struct PendingTurn {
    entry_index: usize,
    blocks: Vec<ContextBlock>,
    client: Arc<ApiClient>,
    assembler: Assembler,
}

impl PendingTurn {
    pub fn entry_index(&self) -> usize {
        self.entry_index
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.assembler.cancel_token()
    }

    pub async fn run(self, updates: mpsc::UnboundedSender<AssemblerUpdate>) -> FinishedTurn {
        let Self {
            entry_index,
            blocks,
            client,
            assembler,
        } = self;
        let outcome = assembler.run(client.create_stream(&blocks), &updates).await;
        FinishedTurn {
            entry_index,
            outcome,
        }
    }
}

#[derive(Debug)]
pub struct FinishedTurn {
    pub entry_index: usize,
    pub outcome: TurnOutcome,
}

struct ActiveTurn {
    entry_index: usize,
    cancel: CancellationToken,
}

/// Chat state for one viewer: transcript, data cache and the in-flight turn.
///
/// At most one turn is live at a time. Starting a new turn cancels its
/// predecessor, so two replies can never interleave in the transcript.
pub struct ChatSession {
    client: Arc<ApiClient>,
    cache: DataCache,
    viewer: Viewer,
    currency: String,
    idle_timeout: Duration,
    messages: Vec<ChatEntry>,
    active_turn: Option<ActiveTurn>,
}

impl ChatSession {
    pub fn new(config: &Config, client: ApiClient) -> Self {
        Self {
            client: Arc::new(client),
            cache: DataCache::new(),
            viewer: config.viewer.clone(),
            currency: config.currency.clone(),
            idle_timeout: config.idle_timeout,
            messages: Vec::new(),
            active_turn: None,
        }
    }

    pub fn with_cache(mut self, cache: DataCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn client(&self) -> Arc<ApiClient> {
        Arc::clone(&self.client)
    }

    pub fn messages(&self) -> &[ChatEntry] {
        &self.messages
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    pub fn is_turn_in_progress(&self) -> bool {
        self.active_turn.is_some()
    }

    /// Reloads store data. Returns whether the product catalog is available;
    /// when it is not, a notice is added to the transcript.
    pub async fn refresh_data(&mut self, backend: &BackendClient) -> bool {
        let snapshot = self.cache.refresh(backend).await;
        if !snapshot.has_catalog() {
            self.messages.push(ChatEntry::new(
                Author::System,
                DATA_UNAVAILABLE_NOTICE,
                EntryStatus::Complete,
            ));
        }
        snapshot.has_catalog()
    }

    pub fn invalidate_data(&mut self) {
        self.cache.invalidate();
    }

    /// Registers a new turn for `utterance`, cancelling any turn still running.
    ///
    /// Returns `None` for blank input.
    pub fn start_turn(&mut self, utterance: &str) -> Option<PendingTurn> {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return None;
        }

        self.cancel();

        let snapshot = self.cache.snapshot();
        let blocks = ContextBuilder::new(&snapshot, &self.currency).build(&self.viewer, utterance);

        self.messages
            .push(ChatEntry::new(Author::User, utterance, EntryStatus::Complete));
        self.messages
            .push(ChatEntry::new(Author::Assistant, "", EntryStatus::Pending));
        let entry_index = self.messages.len() - 1;

        let cancel = CancellationToken::new();
        self.active_turn = Some(ActiveTurn {
            entry_index,
            cancel: cancel.clone(),
        });
        tracing::debug!(entry_index, role = %self.viewer.role, "starting assistant turn");

        Some(PendingTurn {
            entry_index,
            blocks,
            client: Arc::clone(&self.client),
            assembler: Assembler::new(self.idle_timeout, cancel),
        })
    }

    /// Mirrors a streaming update into the transcript entry it belongs to.
    pub fn apply_update(&mut self, entry_index: usize, update: &AssemblerUpdate) {
        if !self.is_active(entry_index) {
            return;
        }
        let Some(entry) = self.messages.get_mut(entry_index) else {
            return;
        };
        match update {
            AssemblerUpdate::Delta(rendered) => {
                entry.text.clone_from(rendered);
                entry.status = EntryStatus::Streaming;
            }
            AssemblerUpdate::Complete(rendered) => {
                entry.text.clone_from(rendered);
            }
            AssemblerUpdate::Error(_) => {}
        }
    }

    /// Records the final state of a turn. Errors become their own entry so the
    /// assistant's partial reply is kept as received. A turn that was superseded
    /// by a newer one only updates its own entry.
    pub fn finish_turn(&mut self, finished: FinishedTurn) {
        let FinishedTurn {
            entry_index,
            outcome,
        } = finished;

        if self.is_active(entry_index) {
            self.active_turn = None;
        }

        let Some(entry) = self.messages.get_mut(entry_index) else {
            return;
        };
        match outcome {
            TurnOutcome::Completed(rendered) => {
                entry.text = rendered;
                entry.status = EntryStatus::Complete;
            }
            TurnOutcome::Cancelled { partial } => {
                entry.text = partial;
                entry.status = EntryStatus::Cancelled;
            }
            TurnOutcome::Failed { error, partial } => {
                entry.text = partial;
                entry.status = EntryStatus::Failed;
                // A newer turn already owns the tail of the transcript.
                if entry_index + 1 == self.messages.len() {
                    self.messages.push(ChatEntry::new(
                        Author::System,
                        error.user_message(),
                        EntryStatus::Complete,
                    ));
                } else {
                    tracing::debug!(entry_index, %error, "dropping error notice of superseded turn");
                }
            }
        }
    }

    /// Runs a turn to completion on the current task.
    pub async fn send(
        &mut self,
        utterance: &str,
        updates: mpsc::UnboundedSender<AssemblerUpdate>,
    ) -> Option<&ChatEntry> {
        let turn = self.start_turn(utterance)?;
        let finished = turn.run(updates).await;
        let entry_index = finished.entry_index;
        self.finish_turn(finished);
        self.messages.get(entry_index)
    }

    /// Cancels the in-flight turn, if any. Nothing more is published for it.
    pub fn cancel(&mut self) {
        if let Some(active) = self.active_turn.take() {
            tracing::debug!(entry_index = active.entry_index, "cancelling assistant turn");
            active.cancel.cancel();
        }
    }

    fn is_active(&self, entry_index: usize) -> bool {
        self.active_turn
            .as_ref()
            .is_some_and(|active| active.entry_index == entry_index)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel();
    }
}
