use async_trait::async_trait;
use image::DynamicImage;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::api_client::{OpenAiClient, StructuredRequest};
use super::{DiagramContent, DiagramExtractor};
use crate::core::errors::ExtractResult;

const DIAGRAM_SYSTEM_PROMPT: &str = "You are a diagram/sketch extractor.
Analyze the given image by capturing every part of it.
The output includes:
- heading i.e., Top View, Front View, Side Cross-Sectional View and so on.
- a detailed description of the diagram/sketch that explains each part of the diagram.
- annotations list of the diagram/sketch. Include every annotation/marking present in the image, \
with the specification of each marking i.e., diameter, geometric tolerance, length and so on. \
Be specific and detailed.";

fn diagram_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "diag_heading": {"type": "string", "description": "Heading of the diagram/sketch"},
            "diag_description": {"type": "string", "description": "Detailed description of the diagram/sketch"},
            "annotations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "marking": {"type": "string", "description": "Marking of the diagram/sketch"},
                        "description": {"type": "string", "description": "Specification of the marking"}
                    },
                    "required": ["marking", "description"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["diag_heading", "diag_description", "annotations"],
        "additionalProperties": false
    })
}

/// DIAGRAM extractor backed by a vision chat model
pub struct LlmDiagramExtractor {
    client: Arc<OpenAiClient>,
    model: String,
}

impl LlmDiagramExtractor {
    pub fn new(client: Arc<OpenAiClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl DiagramExtractor for LlmDiagramExtractor {
    fn name(&self) -> &str {
        "llm-diagram"
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn extract(&self, image: &DynamicImage) -> ExtractResult<DiagramContent> {
        let content: DiagramContent = self
            .client
            .structured(
                "diagram",
                StructuredRequest {
                    model: &self.model,
                    system: DIAGRAM_SYSTEM_PROMPT,
                    prompt: "extract the content in this image.",
                    image,
                    schema_name: "diagram_content",
                    schema: diagram_schema(),
                    temperature: 1.0,
                },
            )
            .await?;

        debug!("Diagram '{}' with {} annotations", content.heading, content.annotations.len());
        Ok(content)
    }
}
