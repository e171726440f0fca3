use async_trait::async_trait;
use image::DynamicImage;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::api_client::{OpenAiClient, StructuredRequest};
use super::{OcrEngine, TextContent, TextExtraction, TextExtractor};
use crate::core::errors::{ExtractResult, ExtractionError};

const TEXT_SYSTEM_PROMPT: &str = "You are a text extractor.
Analyze the given image by capturing every part of it.
The output includes:
- title of the text content, just assign some title or heading to the text content.
- a small description of the text content that explains each part of it.
- extracted text content, MAKE SURE you extract the text as it is.";

fn text_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string", "description": "title of the text content"},
            "description": {"type": "string", "description": "a small description of the text content"},
            "extracted_content": {"type": "string", "description": "extracted text content"}
        },
        "required": ["title", "description", "extracted_content"],
        "additionalProperties": false
    })
}

/// TEXT extractor backed by a vision chat model
pub struct LlmTextExtractor {
    client: Arc<OpenAiClient>,
    model: String,
}

impl LlmTextExtractor {
    pub fn new(client: Arc<OpenAiClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl TextExtractor for LlmTextExtractor {
    fn name(&self) -> &str {
        "llm-text"
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn extract(&self, image: &DynamicImage) -> ExtractResult<TextExtraction> {
        let content: TextContent = self
            .client
            .structured(
                "text",
                StructuredRequest {
                    model: &self.model,
                    system: TEXT_SYSTEM_PROMPT,
                    prompt: "extract the content in this image.",
                    image,
                    schema_name: "text_content",
                    schema: text_schema(),
                    temperature: 1.0,
                },
            )
            .await?;

        debug!("Extracted {} chars of text", content.extracted_content.len());
        Ok(TextExtraction::Summary(content))
    }
}

/// TEXT extractor that runs a local OCR engine and returns its pages as-is
pub struct OcrTextExtractor {
    engine: Arc<dyn OcrEngine>,
    languages: Vec<String>,
}

impl OcrTextExtractor {
    pub fn new(engine: Arc<dyn OcrEngine>, languages: Vec<String>) -> Self {
        Self { engine, languages }
    }
}

#[async_trait]
impl TextExtractor for OcrTextExtractor {
    fn name(&self) -> &str {
        "ocr"
    }

    async fn extract(&self, image: &DynamicImage) -> ExtractResult<TextExtraction> {
        let pages = self
            .engine
            .recognize(std::slice::from_ref(image), &self.languages)
            .await?;
        if pages.is_empty() {
            return Err(ExtractionError::EmptyResult);
        }
        Ok(TextExtraction::Pages(pages))
    }
}
