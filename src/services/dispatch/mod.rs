//! Annotation dispatch.
//!
//! A request moves through `Received -> Decoded -> Oriented -> Extracted ->
//! Responded`. Any stage may fail into `Errored`, which still ends in a
//! response: the envelope always reports `success: true` and carries the
//! failure inside `result`.

pub mod fallback;

use image::DynamicImage;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

use crate::core::annotation::{Annotation, AnnotationKind, AnnotationRequest, Rotation};
use crate::core::errors::{DispatchError, DispatchResult, ExtractResult, ExtractionError};
use crate::services::detection::geometry::{correct_tilt, TiltCorrection};
use crate::services::extraction::{
    DiagramContent, DiagramExtractor, TableExtraction, TableExtractor, TextExtraction,
    TextExtractor,
};
use crate::utils::{decode_image_data, Metrics};

/// Pipeline stage of one annotation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    Oriented,
    Extracted,
    Responded,
    Errored,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "RECEIVED",
            Stage::Decoded => "DECODED",
            Stage::Oriented => "ORIENTED",
            Stage::Extracted => "EXTRACTED",
            Stage::Responded => "RESPONDED",
            Stage::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResult {
    pub error: bool,
    pub message: String,
}

/// Extractor output keyed by annotation kind, or an embedded error
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExtractionResult {
    Text(TextExtraction),
    Table(TableExtraction),
    Diagram(DiagramContent),
    Error(ErrorResult),
}

impl ExtractionResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorResult {
            error: true,
            message: message.into(),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Wire envelope for `/process-annotation`
#[derive(Debug, Clone, Serialize)]
pub struct AnnotationEnvelope {
    pub success: bool,
    pub annotation_id: Value,
    pub result: ExtractionResult,
}

impl AnnotationEnvelope {
    fn new(annotation_id: Value, result: ExtractionResult) -> Self {
        Self {
            success: true,
            annotation_id,
            result,
        }
    }
}

/// Routes annotations to the extractor for their kind.
///
/// Extractor handles are injected at construction and shared read-only
/// across requests.
pub struct AnnotationDispatcher {
    text: Arc<dyn TextExtractor>,
    table: Arc<dyn TableExtractor>,
    diagram: Arc<dyn DiagramExtractor>,
    languages: Vec<String>,
    metrics: Metrics,
}

impl AnnotationDispatcher {
    pub fn new(
        text: Arc<dyn TextExtractor>,
        table: Arc<dyn TableExtractor>,
        diagram: Arc<dyn DiagramExtractor>,
        metrics: Metrics,
    ) -> Self {
        Self {
            text,
            table,
            diagram,
            languages: vec!["en".to_string()],
            metrics,
        }
    }

    /// Language hints reported on OCR-shaped TEXT fallbacks
    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    pub fn extractor_names(&self) -> [&str; 3] {
        [self.text.name(), self.table.name(), self.diagram.name()]
    }

    /// Validate a raw JSON body and dispatch it. Never fails.
    pub async fn handle_json(&self, body: Value) -> AnnotationEnvelope {
        let request = match AnnotationRequest::from_value(body) {
            Ok(request) => request,
            Err((id, e)) => return self.reject(id, e),
        };

        let id = request.id.clone();
        match Annotation::try_from(request) {
            Ok(annotation) => self.dispatch(annotation).await,
            Err(e) => self.reject(id, e),
        }
    }

    /// Run one validated annotation through the pipeline
    #[instrument(skip_all, fields(id = %annotation.id, kind = %annotation.kind))]
    pub async fn dispatch(&self, annotation: Annotation) -> AnnotationEnvelope {
        let start = Instant::now();
        self.metrics.record_annotation(annotation.kind.as_str());

        let result = match self.process(&annotation).await {
            Ok(result) => result,
            Err(e) => {
                debug!("{} -> {}: {}", Stage::Received, Stage::Errored, e);
                self.metrics.record_annotation_error();
                ExtractionResult::error(e.to_string())
            }
        };

        debug!(
            "{} in {:.2}ms",
            Stage::Responded,
            start.elapsed().as_secs_f64() * 1000.0
        );
        AnnotationEnvelope::new(annotation.id, result)
    }

    /// Envelope for a request that never reached the pipeline
    pub fn reject(&self, id: Value, error: DispatchError) -> AnnotationEnvelope {
        warn!("Rejected annotation {}: {}", id, error);
        self.metrics.record_annotation_error();
        AnnotationEnvelope::new(id, ExtractionResult::error(error.to_string()))
    }

    async fn process(&self, annotation: &Annotation) -> DispatchResult<ExtractionResult> {
        let image = decode_image_data(&annotation.image_data)?;
        debug!("{}: {}x{}", Stage::Decoded, image.width(), image.height());

        let image = orient(image, annotation.rotation)?;
        debug!("{}: {}x{}", Stage::Oriented, image.width(), image.height());

        let result = self.extract(annotation, &image).await;
        debug!("{}", Stage::Extracted);
        Ok(result)
    }

    async fn extract(&self, annotation: &Annotation, image: &DynamicImage) -> ExtractionResult {
        let kind = annotation.kind;
        match kind {
            AnnotationKind::Text => {
                let outcome = self.text.extract(image).await;
                let text = self.usable(kind, outcome, TextExtraction::is_empty).unwrap_or_else(|e| {
                    let bbox = annotation.bbox_or_image(image.width(), image.height());
                    let image_bbox = [0.0, 0.0, f64::from(image.width()), f64::from(image.height())];
                    fallback::text(bbox, image_bbox, &self.languages, e.as_ref())
                });
                ExtractionResult::Text(text)
            }
            AnnotationKind::Table => {
                let outcome = self.table.extract(image).await;
                let table = self
                    .usable(kind, outcome, TableExtraction::is_empty)
                    .unwrap_or_else(|e| fallback::table(e.as_ref()));
                ExtractionResult::Table(table)
            }
            AnnotationKind::Diagram => {
                let outcome = self.diagram.extract(image).await;
                let diagram = self
                    .usable(kind, outcome, DiagramContent::is_empty)
                    .unwrap_or_else(|e| fallback::diagram(e.as_ref()));
                ExtractionResult::Diagram(diagram)
            }
        }
    }

    /// `Err(None)` for an empty answer, `Err(Some(_))` for a failed call
    fn usable<T>(
        &self,
        kind: AnnotationKind,
        outcome: ExtractResult<T>,
        is_empty: fn(&T) -> bool,
    ) -> Result<T, Option<ExtractionError>> {
        match outcome {
            Ok(content) if !is_empty(&content) => Ok(content),
            Ok(_) | Err(ExtractionError::EmptyResult) => {
                debug!("{} extractor found nothing, using fallback", kind);
                self.metrics.record_fallback(kind.as_str());
                Err(None)
            }
            Err(e) => {
                warn!("{} extraction failed, using fallback: {}", kind, e);
                self.metrics.record_fallback(kind.as_str());
                Err(Some(e))
            }
        }
    }
}

/// Undo the rotation the caller's UI applied
fn orient(image: DynamicImage, rotation: Rotation) -> DispatchResult<DynamicImage> {
    if image.width() == 0 || image.height() == 0 {
        return Err(DispatchError::Orientation(format!(
            "image has no pixels ({}x{})",
            image.width(),
            image.height()
        )));
    }
    if rotation == Rotation::Deg0 {
        return Ok(image);
    }
    Ok(correct_tilt(image, TiltCorrection::Declared(rotation)))
}
