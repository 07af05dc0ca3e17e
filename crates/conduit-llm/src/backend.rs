//! LLM backend trait and streaming types.
//!
//! Backends do not retry internally: callers compose retry and circuit
//! breaking around [`LlmBackend::complete`] themselves.

use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, ContentBlock, StopReason, Usage};

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Types
// ─────────────────────────────────────────────────────────────────────────────

/// A streaming response from an LLM backend.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + 'static>>;

/// Events emitted during streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Message started.
    MessageStart { id: String, model: String },
    /// Content block started.
    ContentBlockStart { index: usize, block: BlockStart },
    /// Delta within a content block.
    ContentBlockDelta { index: usize, delta: ContentDelta },
    /// Content block finished.
    ContentBlockStop { index: usize },
    /// Message finished with final usage stats.
    MessageDelta {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Message complete.
    MessageStop,
    /// Ping to keep connection alive.
    Ping,
    /// Error reported in-band by the provider.
    Error { message: String },
}

/// Kind of content block a [`StreamEvent::ContentBlockStart`] opens.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
}

/// Delta content in a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentDelta {
    /// Text being streamed.
    TextDelta(String),
    /// Partial JSON for tool input.
    InputJsonDelta(String),
}

impl StreamEvent {
    /// Returns true if this is an error event.
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error { .. })
    }

    /// Returns true if this is the final event in a message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::MessageStop | StreamEvent::Error { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Accumulator
// ─────────────────────────────────────────────────────────────────────────────

enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Folds stream events back into a [`CompletionResponse`].
#[derive(Default)]
pub struct StreamAccumulator {
    id: String,
    model: String,
    blocks: BTreeMap<usize, PartialBlock>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Deltas for an unopened index open a block of the
    /// matching kind.
    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { id, model } => {
                self.id = id.clone();
                self.model = model.clone();
            }
            StreamEvent::ContentBlockStart { index, block } => {
                let partial = match block {
                    BlockStart::Text => PartialBlock::Text(String::new()),
                    BlockStart::ToolUse { id, name } => PartialBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        json: String::new(),
                    },
                };
                self.blocks.insert(*index, partial);
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta(text) => {
                    if let PartialBlock::Text(buf) = self
                        .blocks
                        .entry(*index)
                        .or_insert_with(|| PartialBlock::Text(String::new()))
                    {
                        buf.push_str(text);
                    }
                }
                ContentDelta::InputJsonDelta(fragment) => {
                    if let Some(PartialBlock::ToolUse { json, .. }) = self.blocks.get_mut(index) {
                        json.push_str(fragment);
                    }
                }
            },
            StreamEvent::MessageDelta { stop_reason, usage } => {
                self.stop_reason = Some(*stop_reason);
                self.usage.add(*usage);
            }
            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => {}
        }
    }

    /// Build the response. Tool inputs that are not valid JSON fail.
    pub fn finish(self) -> Result<CompletionResponse> {
        let mut content = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.into_values() {
            match block {
                PartialBlock::Text(text) if text.is_empty() => {}
                PartialBlock::Text(text) => content.push(ContentBlock::Text { text }),
                PartialBlock::ToolUse { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&json).map_err(|e| {
                            LlmError::Serialization(format!(
                                "invalid streamed input for tool '{}': {}",
                                name, e
                            ))
                        })?
                    };
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
            }
        }

        let has_tool_use = content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let stop_reason = self.stop_reason.unwrap_or(if has_tool_use {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });

        Ok(CompletionResponse::new(
            self.id,
            self.model,
            content,
            stop_reason,
            self.usage,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for LLM backend providers.
///
/// Tools are passed natively through `request.tools`; responses carry
/// structured tool-use blocks.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Execute a completion request and return the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Execute a completion request and return a stream of events.
    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream>;

    /// Get the name of this backend.
    fn name(&self) -> &str;

    /// Check if the backend is available and properly configured.
    async fn health_check(&self) -> Result<()>;
}

/// Turn a complete response into the event sequence a streaming backend
/// would have produced.
pub fn response_events(response: CompletionResponse) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::MessageStart {
        id: response.id.clone(),
        model: response.model.clone(),
    }];

    for (index, block) in response.content.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::Text,
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::TextDelta(text.clone()),
                });
            }
            ContentBlock::ToolUse { id, name, input } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta(input.to_string()),
                });
            }
            ContentBlock::ToolResult { .. } => continue,
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    events.push(StreamEvent::MessageDelta {
        stop_reason: response.stop_reason.unwrap_or(StopReason::EndTurn),
        usage: response.usage,
    });
    events.push(StreamEvent::MessageStop);
    events
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared Backend Type
// ─────────────────────────────────────────────────────────────────────────────

/// A backend that can be shared across threads.
pub type SharedBackend = Arc<dyn LlmBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_event_is_terminal() {
        assert!(StreamEvent::MessageStop.is_terminal());
        assert!(
            StreamEvent::Error {
                message: "err".to_string()
            }
            .is_terminal()
        );
        assert!(!StreamEvent::Ping.is_terminal());
        assert!(!StreamEvent::ContentBlockStop { index: 0 }.is_terminal());
    }

    #[test]
    fn test_accumulator_roundtrips_response_events() {
        let response = CompletionResponse::new(
            "msg_1",
            "llama3.2",
            vec![
                ContentBlock::text("Checking."),
                ContentBlock::tool_use("call_1", "query", json!({"sql": "SELECT 1"})),
            ],
            StopReason::ToolUse,
            Usage::new(12, 8),
        );

        let mut acc = StreamAccumulator::new();
        for event in response_events(response) {
            acc.push(&event);
        }
        let rebuilt = acc.finish().unwrap();

        assert_eq!(rebuilt.id, "msg_1");
        assert_eq!(rebuilt.text(), "Checking.");
        assert_eq!(rebuilt.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(rebuilt.usage, Usage::new(12, 8));
        let uses = rebuilt.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].input, json!({"sql": "SELECT 1"}));
    }

    #[test]
    fn test_accumulator_joins_fragmented_json() {
        let mut acc = StreamAccumulator::new();
        acc.push(&StreamEvent::ContentBlockStart {
            index: 1,
            block: BlockStart::ToolUse {
                id: "c".to_string(),
                name: "add".to_string(),
            },
        });
        for fragment in ["{\"a\":", " 1, \"b\"", ": 2}"] {
            acc.push(&StreamEvent::ContentBlockDelta {
                index: 1,
                delta: ContentDelta::InputJsonDelta(fragment.to_string()),
            });
        }
        let response = acc.finish().unwrap();
        assert_eq!(response.tool_uses()[0].input, json!({"a": 1, "b": 2}));
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn test_accumulator_text_without_start() {
        let mut acc = StreamAccumulator::new();
        for piece in ["Hel", "lo"] {
            acc.push(&StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::TextDelta(piece.to_string()),
            });
        }
        let response = acc.finish().unwrap();
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn test_accumulator_invalid_tool_json() {
        let mut acc = StreamAccumulator::new();
        acc.push(&StreamEvent::ContentBlockStart {
            index: 0,
            block: BlockStart::ToolUse {
                id: "c".to_string(),
                name: "broken".to_string(),
            },
        });
        acc.push(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::InputJsonDelta("{not json".to_string()),
        });
        assert!(matches!(acc.finish(), Err(LlmError::Serialization(_))));
    }
}
