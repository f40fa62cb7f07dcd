use crate::api::stream::StreamParser;
use crate::render::render_message;
use crate::types::StreamEvent;
use anyhow::Result;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shown to the user for every transport-level failure of a turn.
pub const TRANSPORT_ERROR_MESSAGE: &str =
    "Sorry, the assistant could not answer right now. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    AwaitingFirstByte,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// What the view layer receives while a turn is in flight.
///
/// `Delta` and `Complete` always carry the full rendered reply so far, so
/// replaying the same update is harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerUpdate {
    Delta(String),
    Complete(String),
    Error(String),
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("no data received for {0:?}")]
    Timeout(Duration),
}

impl TurnError {
    /// Provider messages are shown verbatim; everything else gets fixed text.
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(message) => message.clone(),
            Self::Transport(_) | Self::Timeout(_) => TRANSPORT_ERROR_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum TurnOutcome {
    Completed(String),
    Failed { error: TurnError, partial: String },
    Cancelled { partial: String },
}

impl TurnOutcome {
    pub fn state(&self) -> AssemblerState {
        match self {
            Self::Completed(_) => AssemblerState::Completed,
            Self::Failed { .. } => AssemblerState::Failed,
            Self::Cancelled { .. } => AssemblerState::Cancelled,
        }
    }

    /// Rendered reply text, complete or partial.
    pub fn rendered(&self) -> &str {
        match self {
            Self::Completed(rendered) => rendered,
            Self::Failed { partial, .. } | Self::Cancelled { partial } => partial,
        }
    }
}

/// Turns one streamed completion response into progressively rendered text.
///
/// An assembler serves exactly one request. The accumulated reply only ever
/// grows, and every publish re-renders it from scratch.
pub struct Assembler {
    state: AssemblerState,
    parser: StreamParser,
    accumulated: String,
    rendered: String,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl Assembler {
    pub fn new(idle_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            state: AssemblerState::Idle,
            parser: StreamParser::new(),
            accumulated: String::new(),
            rendered: String::new(),
            idle_timeout,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drives `request` (which resolves to the response body once headers
    /// arrive) to a terminal outcome, publishing progress on `updates`.
    ///
    /// Never returns an error: every failure becomes one `AssemblerUpdate::Error`
    /// and a `TurnOutcome::Failed`. After cancellation nothing is published.
    pub async fn run<F, S>(
        mut self,
        request: F,
        updates: &mpsc::UnboundedSender<AssemblerUpdate>,
    ) -> TurnOutcome
    where
        F: Future<Output = Result<S>>,
        S: Stream<Item = Result<Bytes>>,
    {
        self.transition(AssemblerState::AwaitingFirstByte);
        let cancel = self.cancel.clone();
        let idle_timeout = self.idle_timeout;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.cancelled(),
            response = tokio::time::timeout(idle_timeout, request) => response,
        };
        let stream = match response {
            Err(_) => return self.fail(TurnError::Timeout(idle_timeout), updates),
            Ok(Err(error)) => return self.fail(TurnError::Transport(format!("{error:#}")), updates),
            Ok(Ok(stream)) => stream,
        };
        let mut stream = pin!(stream);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                next = tokio::time::timeout(idle_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => return self.fail(TurnError::Timeout(idle_timeout), updates),
                Ok(Some(Err(error))) => {
                    return self.fail(TurnError::Transport(format!("{error:#}")), updates)
                }
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => {
                    let events = self.parser.finish();
                    if let Some(outcome) = self.apply(events, updates) {
                        return outcome;
                    }
                    return self.complete(updates);
                }
            };

            if self.state == AssemblerState::AwaitingFirstByte {
                self.transition(AssemblerState::Streaming);
            }
            let events = self.parser.process(&chunk);
            if let Some(outcome) = self.apply(events, updates) {
                return outcome;
            }
        }
    }

    fn apply(
        &mut self,
        events: Vec<StreamEvent>,
        updates: &mpsc::UnboundedSender<AssemblerUpdate>,
    ) -> Option<TurnOutcome> {
        for event in events {
            match event {
                StreamEvent::Delta(fragment) => {
                    self.accumulated.push_str(&fragment);
                    self.rendered = render_message(&self.accumulated);
                    if !self.publish(updates, AssemblerUpdate::Delta(self.rendered.clone())) {
                        return Some(self.cancelled());
                    }
                }
                StreamEvent::Done => return Some(self.complete(updates)),
                StreamEvent::Error(message) => {
                    return Some(self.fail(TurnError::Provider(message), updates))
                }
            }
        }
        None
    }

    fn complete(&mut self, updates: &mpsc::UnboundedSender<AssemblerUpdate>) -> TurnOutcome {
        if !self.publish(updates, AssemblerUpdate::Complete(self.rendered.clone())) {
            return self.cancelled();
        }
        self.transition(AssemblerState::Completed);
        TurnOutcome::Completed(std::mem::take(&mut self.rendered))
    }

    fn fail(
        &mut self,
        error: TurnError,
        updates: &mpsc::UnboundedSender<AssemblerUpdate>,
    ) -> TurnOutcome {
        tracing::warn!(%error, received = self.accumulated.len(), "assistant turn failed");
        if !self.publish(updates, AssemblerUpdate::Error(error.user_message())) {
            return self.cancelled();
        }
        self.transition(AssemblerState::Failed);
        TurnOutcome::Failed {
            error,
            partial: std::mem::take(&mut self.rendered),
        }
    }

    fn cancelled(&mut self) -> TurnOutcome {
        tracing::debug!(received = self.accumulated.len(), "assistant turn cancelled");
        self.transition(AssemblerState::Cancelled);
        TurnOutcome::Cancelled {
            partial: std::mem::take(&mut self.rendered),
        }
    }

    /// Sends `update` unless the turn has been cancelled.
    fn publish(
        &self,
        updates: &mpsc::UnboundedSender<AssemblerUpdate>,
        update: AssemblerUpdate,
    ) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        // A dropped receiver only means nobody is watching this turn any more.
        let _ = updates.send(update);
        true
    }

    fn transition(&mut self, next: AssemblerState) {
        tracing::trace!(from = ?self.state, to = ?next, "assembler state change");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&str]) -> Vec<Result<Bytes>> {
        parts
            .iter()
            .map(|part| Ok(Bytes::from(part.to_string())))
            .collect()
    }

    fn delta_frame(content: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AssemblerUpdate>) -> Vec<AssemblerUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    async fn run_parts(parts: Vec<Result<Bytes>>) -> (TurnOutcome, Vec<AssemblerUpdate>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = Assembler::new(Duration::from_secs(5), CancellationToken::new());
        let outcome = assembler
            .run(async { Ok(stream::iter(parts)) }, &tx)
            .await;
        (outcome, drain(&mut rx))
    }

    #[tokio::test]
    async fn test_two_chunks_publish_two_deltas_then_complete() {
        let first = delta_frame("Hel");
        let second = delta_frame("lo **world**");
        let (outcome, updates) = run_parts(chunks(&[&first, &second])).await;

        assert_eq!(
            updates,
            vec![
                AssemblerUpdate::Delta("Hel".to_string()),
                AssemblerUpdate::Delta("Hello <b>world</b>".to_string()),
                AssemblerUpdate::Complete("Hello <b>world</b>".to_string()),
            ]
        );
        assert_eq!(outcome.state(), AssemblerState::Completed);
        assert_eq!(outcome.rendered(), "Hello <b>world</b>");
    }

    #[tokio::test]
    async fn test_done_frame_stops_reading() {
        let first = delta_frame("fin");
        let after = delta_frame("ignored");
        let (outcome, updates) =
            run_parts(chunks(&[&first, "data: [DONE]\n", &after])).await;

        assert_eq!(outcome.rendered(), "fin");
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1], AssemblerUpdate::Complete("fin".to_string()));
    }

    #[tokio::test]
    async fn test_provider_error_is_not_appended() {
        let first = delta_frame("parcial");
        let after = delta_frame("never");
        let (outcome, updates) = run_parts(chunks(&[
            &first,
            "error: {\"message\":\"quota exceeded\"}\n",
            &after,
        ]))
        .await;

        assert_eq!(
            updates.last(),
            Some(&AssemblerUpdate::Error("quota exceeded".to_string()))
        );
        match outcome {
            TurnOutcome::Failed {
                error: TurnError::Provider(message),
                partial,
            } => {
                assert_eq!(message, "quota exceeded");
                assert_eq!(partial, "parcial");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_error_publishes_fixed_message_and_keeps_partial() {
        let first = delta_frame("medio");
        let parts = vec![
            Ok(Bytes::from(first)),
            Err(anyhow::anyhow!("connection reset")),
        ];
        let (outcome, updates) = run_parts(parts).await;

        assert_eq!(
            updates.last(),
            Some(&AssemblerUpdate::Error(TRANSPORT_ERROR_MESSAGE.to_string()))
        );
        assert_eq!(outcome.state(), AssemblerState::Failed);
        assert_eq!(outcome.rendered(), "medio");
    }

    #[tokio::test]
    async fn test_request_failure_fails_before_streaming() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = Assembler::new(Duration::from_secs(5), CancellationToken::new());
        let outcome = assembler
            .run(
                async { Err::<stream::Iter<std::vec::IntoIter<Result<Bytes>>>, _>(anyhow::anyhow!("HTTP 500")) },
                &tx,
            )
            .await;

        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                error: TurnError::Transport(_),
                ..
            }
        ));
        assert_eq!(
            drain(&mut rx),
            vec![AssemblerUpdate::Error(TRANSPORT_ERROR_MESSAGE.to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = Assembler::new(Duration::from_secs(3), CancellationToken::new());
        let outcome = assembler
            .run(async { Ok(stream::pending::<Result<Bytes>>()) }, &tx)
            .await;

        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                error: TurnError::Timeout(_),
                ..
            }
        ));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_turn_publishes_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let assembler = Assembler::new(Duration::from_secs(5), cancel.clone());
        cancel.cancel();

        let first = delta_frame("x");
        let outcome = assembler
            .run(async { Ok(stream::iter(chunks(&[&first]))) }, &tx)
            .await;

        assert_eq!(outcome.state(), AssemblerState::Cancelled);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream_stops_publishing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let assembler = Assembler::new(Duration::from_secs(5), cancel.clone());

        let first = delta_frame("uno");
        let second = delta_frame("dos");
        let cancel_after_first = cancel.clone();
        let mut seen = 0;
        let parts = stream::iter(chunks(&[&first, &second])).inspect(move |_| {
            seen += 1;
            if seen == 2 {
                cancel_after_first.cancel();
            }
        });

        let outcome = assembler.run(async { Ok(parts) }, &tx).await;

        assert_eq!(outcome.state(), AssemblerState::Cancelled);
        assert_eq!(
            drain(&mut rx),
            vec![AssemblerUpdate::Delta("uno".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_flushed_at_eof() {
        let frame = delta_frame("cola");
        let unterminated = frame.trim_end_matches('\n');
        let (outcome, updates) = run_parts(chunks(&[unterminated])).await;

        assert_eq!(outcome.rendered(), "cola");
        assert_eq!(updates.len(), 2);
    }
}
