use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use axum::response::sse::Event;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ClassifiedError;
use crate::models::{Outline, PlacedImage, SearchResult, SeoMetadata, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStep {
    Research,
    Outline,
    Writing,
    Seo,
    Images,
    Wordpress,
    Completed,
}

/// One event on the generation stream. Serialized as
/// `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum StreamFrame {
    Progress(ProgressPayload),
    Complete(Box<CompletePayload>),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub step: PipelineStep,
    pub message: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_section: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_url: Option<String>,
    pub seo_score: u8,
    pub word_count: u32,
    pub article_content: String,
    pub outline: Outline,
    pub seo_metadata: SeoMetadata,
    pub images: Vec<PlacedImage>,
    pub research: ResearchSummary,
    pub recommendations: Vec<String>,
    pub token_usage: TokenUsage,
    pub total_tokens: u64,
}

/// Condensed research info for the final payload: the full result list stays
/// server-side, the client gets the model, queries, usage, and a small sample.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchSummary {
    pub model: String,
    pub queries: Vec<String>,
    pub usage: TokenUsage,
    pub sample: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    pub hint: String,
}

/// Write side of a generation stream.
///
/// Exactly one terminal frame (`complete` or `error`) ever goes out: the first
/// terminal send flips `closed` and every later write is suppressed. A dropped
/// receiver (client disconnect) makes sends no-ops as well.
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<StreamFrame>,
    closed: AtomicBool,
}

impl ProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn progress(
        &self,
        step: PipelineStep,
        message: impl Into<String>,
        progress: u8,
        current_section: Option<String>,
    ) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(StreamFrame::Progress(ProgressPayload {
            step,
            message: message.into(),
            progress,
            current_section,
        }));
    }

    /// Returns false if a terminal frame was already sent or the client is gone.
    pub fn complete(&self, payload: CompletePayload) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tx.send(StreamFrame::Complete(Box::new(payload))).is_ok()
    }

    /// Returns false if a terminal frame was already sent or the client is gone.
    pub fn error(&self, err: ClassifiedError) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tx
            .send(StreamFrame::Error(ErrorPayload {
                message: err.message,
                hint: err.hint,
            }))
            .is_ok()
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.is_closed()
    }
}

impl StreamFrame {
    pub fn to_event(&self) -> Event {
        match serde_json::to_string(self) {
            Ok(json) => Event::default().data(json),
            // frames are plain data, serialization does not fail in practice
            Err(_) => Event::default().data("{}"),
        }
    }
}

/// Adapts the frame channel into the `Stream<Item = Result<Event, _>>` that
/// axum's Sse response wants. Ends when the sink side is dropped.
pub struct FrameStream {
    rx: mpsc::UnboundedReceiver<StreamFrame>,
}

impl FrameStream {
    pub fn new(rx: mpsc::UnboundedReceiver<StreamFrame>) -> Self {
        Self { rx }
    }
}

impl futures_core::Stream for FrameStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame.to_event()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_error() -> ClassifiedError {
        ClassifiedError {
            message: "boom".to_string(),
            hint: "retry".to_string(),
        }
    }

    fn empty_payload() -> CompletePayload {
        CompletePayload {
            post_id: None,
            edit_url: None,
            seo_score: 0,
            word_count: 0,
            article_content: String::new(),
            outline: Outline {
                title: "t".to_string(),
                introduction: Default::default(),
                sections: Vec::new(),
                conclusion: Default::default(),
            },
            seo_metadata: Default::default(),
            images: Vec::new(),
            research: ResearchSummary {
                model: String::new(),
                queries: Vec::new(),
                usage: Default::default(),
                sample: Vec::new(),
            },
            recommendations: Vec::new(),
            token_usage: Default::default(),
            total_tokens: 0,
        }
    }

    #[test]
    fn terminal_frame_goes_out_exactly_once() {
        let (sink, mut rx) = ProgressSink::new();
        assert!(sink.complete(empty_payload()));
        assert!(!sink.complete(empty_payload()));
        assert!(!sink.error(sample_error()));

        let mut frames = 0;
        while rx.try_recv().is_ok() {
            frames += 1;
        }
        assert_eq!(frames, 1);
    }

    #[test]
    fn progress_after_terminal_is_suppressed() {
        let (sink, mut rx) = ProgressSink::new();
        sink.error(sample_error());
        sink.progress(PipelineStep::Writing, "late", 50, None);

        assert!(matches!(rx.try_recv(), Ok(StreamFrame::Error(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sends_after_disconnect_do_not_panic() {
        let (sink, rx) = ProgressSink::new();
        drop(rx);
        assert!(sink.is_disconnected());
        sink.progress(PipelineStep::Research, "x", 10, None);
        assert!(!sink.complete(empty_payload()));
    }

    #[test]
    fn progress_frame_wire_shape() {
        let frame = StreamFrame::Progress(ProgressPayload {
            step: PipelineStep::Writing,
            message: "Writing section".to_string(),
            progress: 52,
            current_section: Some("History".to_string()),
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        assert!(json.contains("\"step\":\"writing\""));
        assert!(json.contains("\"currentSection\":\"History\""));
        assert!(json.contains("\"progress\":52"));
    }

    #[test]
    fn complete_frame_omits_absent_post_id() {
        let json = serde_json::to_string(&StreamFrame::Complete(Box::new(empty_payload()))).unwrap();
        assert!(json.contains("\"type\":\"complete\""));
        assert!(!json.contains("postId"));
        assert!(json.contains("\"totalTokens\":0"));
    }
}
