//! Content extractors invoked by the annotation dispatcher.
//!
//! Each annotation kind has its own capability trait so handles can be
//! injected independently: LLM-backed implementations live in `text`,
//! `table` and `diagram`, and `OcrTextExtractor` adapts any `OcrEngine`.

pub mod api_client;
pub mod diagram;
pub mod table;
pub mod text;

use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::core::errors::ExtractResult;

pub use api_client::{AnthropicClient, ApiClient, OpenAiClient};
pub use diagram::LlmDiagramExtractor;
pub use table::{extract_html_tables, ClaudeTableExtractor};
pub use text::{LlmTextExtractor, OcrTextExtractor};

/// One recognized line of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    /// Corner points, clockwise from top-left
    pub polygon: Vec<[f64; 2]>,
    pub confidence: f64,
    pub text: String,
    pub bbox: [f64; 4],
}

/// OCR output for a single image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrPage {
    pub text_lines: Vec<TextLine>,
    pub languages: Vec<String>,
    pub image_bbox: [f64; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub title: String,
    pub description: String,
    pub extracted_content: String,
}

/// TEXT result: a structured summary or raw OCR pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextExtraction {
    Summary(TextContent),
    Pages(Vec<OcrPage>),
}

impl TextExtraction {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Summary(content) => content.extracted_content.trim().is_empty(),
            Self::Pages(pages) => pages
                .iter()
                .flat_map(|page| &page.text_lines)
                .all(|line| line.text.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableContent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub html: String,
}

/// TABLE result: the structured shape or the legacy list of HTML fragments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableExtraction {
    Structured(TableContent),
    Fragments(Vec<String>),
}

impl TableExtraction {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Structured(content) => content.html.trim().is_empty(),
            Self::Fragments(fragments) => fragments.iter().all(|f| f.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramAnnotation {
    pub marking: String,
    pub description: String,
}

/// DIAGRAM result. Accepts the `diag_*` field names LLM schemas emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramContent {
    #[serde(alias = "diag_heading")]
    pub heading: String,
    #[serde(alias = "diag_description")]
    pub description: String,
    #[serde(default)]
    pub annotations: Vec<DiagramAnnotation>,
}

impl DiagramContent {
    pub fn is_empty(&self) -> bool {
        self.heading.trim().is_empty()
            && self.description.trim().is_empty()
            && self.annotations.is_empty()
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, image: &DynamicImage) -> ExtractResult<TextExtraction>;
}

#[async_trait]
pub trait TableExtractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, image: &DynamicImage) -> ExtractResult<TableExtraction>;
}

#[async_trait]
pub trait DiagramExtractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, image: &DynamicImage) -> ExtractResult<DiagramContent>;
}

/// Text recognizer/detector over a batch of images
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// One page per input image, in input order
    async fn recognize(
        &self,
        images: &[DynamicImage],
        languages: &[String],
    ) -> ExtractResult<Vec<OcrPage>>;
}
