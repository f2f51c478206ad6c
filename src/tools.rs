//! The fixed tool set the agent can call and the dispatcher that acknowledges
//! every call.

use crate::deck::{DeckEditor, SlideUpdate};
use crate::protocol::{ToolInvocation, ToolResponse};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },
}

/// A recognised tool call with its parsed arguments
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    GeneratePresentation { topic: String },
    UpdateSlide(SlideUpdate),
    Unknown { name: String },
}

#[derive(Deserialize)]
struct GenerateArgs {
    topic: String,
}

impl ToolCall {
    /// Match `name` exactly against the tool set and parse its arguments.
    pub fn parse(name: &str, arguments: Value) -> Result<Self, ToolError> {
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let invalid = |reason: String| ToolError::InvalidArguments {
            name: name.to_string(),
            reason,
        };

        match name {
            "generate_presentation" => {
                let args: GenerateArgs =
                    serde_json::from_value(arguments).map_err(|e| invalid(e.to_string()))?;
                let topic = args.topic.trim();
                if topic.is_empty() {
                    return Err(invalid("topic cannot be empty".to_string()));
                }
                Ok(ToolCall::GeneratePresentation {
                    topic: topic.to_string(),
                })
            }
            "update_slide" => serde_json::from_value(arguments)
                .map(ToolCall::UpdateSlide)
                .map_err(|e| invalid(e.to_string())),
            _ => Ok(ToolCall::Unknown {
                name: name.to_string(),
            }),
        }
    }
}

/// Local side effects behind the tool set.
#[async_trait]
pub trait DeckActions: Send + Sync {
    async fn generate_presentation(&self, topic: String);
    async fn update_slide(&self, update: SlideUpdate);
}

#[async_trait]
impl DeckActions for DeckEditor {
    async fn generate_presentation(&self, topic: String) {
        if let Err(e) = self.generate(&topic).await {
            log::error!("Presentation generation failed: {}", e);
        }
    }

    async fn update_slide(&self, update: SlideUpdate) {
        DeckEditor::update_slide(self, update).await;
    }
}

#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Declarations for every tool in the set
pub fn tool_set() -> Vec<Tool> {
    vec![
        Tool {
            name: "generate_presentation".to_string(),
            description: "Create a new presentation about a topic, replacing the current one"
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "topic": {
                        "type": "STRING",
                        "description": "What the presentation is about"
                    }
                },
                "required": ["topic"]
            }),
        },
        Tool {
            name: "update_slide".to_string(),
            description: "Change fields of one slide. Only include fields that change."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "slide_index": {
                        "type": "INTEGER",
                        "description": "Zero-based slide number, defaults to the slide on screen"
                    },
                    "title": {"type": "STRING"},
                    "subtitle": {"type": "STRING"},
                    "content": {
                        "type": "ARRAY",
                        "items": {"type": "STRING"},
                        "description": "Bullet points, replaces the existing ones"
                    },
                    "layout": {
                        "type": "STRING",
                        "enum": ["TITLE", "CONTENT", "TWO_COLUMN", "IMAGE_TEXT", "QUOTE"]
                    },
                    "image_prompt": {
                        "type": "STRING",
                        "description": "Description of a new image for the slide"
                    }
                }
            }),
        },
    ]
}

/// Tool definitions in the `functionDeclarations` shape
pub fn declarations() -> Vec<Value> {
    tool_set()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters
            })
        })
        .collect()
}

/// Routes tool calls to deck actions and acknowledges each one immediately.
///
/// Handlers run one at a time on a single worker task, in the order the
/// calls arrived.
#[derive(Clone)]
pub struct ToolDispatcher {
    actions: Arc<dyn DeckActions>,
    queue: Arc<OnceLock<mpsc::UnboundedSender<ToolCall>>>,
}

impl ToolDispatcher {
    pub fn new(actions: Arc<dyn DeckActions>) -> Self {
        Self {
            actions,
            queue: Arc::new(OnceLock::new()),
        }
    }

    /// Queue the handler for `invocation` without waiting for it and return
    /// the acknowledgement. Must be called inside a tokio runtime.
    pub fn dispatch(&self, invocation: ToolInvocation) -> ToolResponse {
        let ToolInvocation {
            id,
            name,
            arguments,
        } = invocation;

        let outcome = ToolCall::parse(&name, arguments).and_then(|call| self.enqueue(call));
        let response = match outcome {
            Ok(()) => {
                log::info!("🔧 Accepted {} ({})", name, id);
                json!({"result": "ok"})
            }
            Err(e) => {
                log::warn!("🔧 Rejected {} ({}): {}", name, id, e);
                json!({"error": e.to_string()})
            }
        };

        ToolResponse { id, name, response }
    }

    fn enqueue(&self, call: ToolCall) -> Result<(), ToolError> {
        if let ToolCall::Unknown { name } = call {
            return Err(ToolError::UnknownTool(name));
        }
        let queue = self.queue.get_or_init(|| self.start_worker());
        if queue.send(call).is_err() {
            log::error!("🔧 Tool worker has stopped, call dropped");
        }
        Ok(())
    }

    fn start_worker(&self) -> mpsc::UnboundedSender<ToolCall> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ToolCall>();
        let actions = self.actions.clone();
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                match call {
                    ToolCall::GeneratePresentation { topic } => {
                        actions.generate_presentation(topic).await
                    }
                    ToolCall::UpdateSlide(update) => actions.update_slide(update).await,
                    ToolCall::Unknown { .. } => {}
                }
            }
            log::debug!("🔧 Tool worker finished");
        });
        tx
    }
}
