// Stand-in results used when an extractor fails or finds nothing.
// Each keeps the success shape of its annotation kind.

use crate::core::annotation::bbox_polygon;
use crate::core::errors::ExtractionError;
use crate::services::extraction::{
    DiagramAnnotation, DiagramContent, OcrPage, TableExtraction, TextExtraction, TextLine,
};

pub const NO_TEXT_MESSAGE: &str = "No text detected in this area";
pub const NO_TABLE_MESSAGE: &str = "No table content could be extracted";
pub const DIAGRAM_ERROR_HEADING: &str = "Error Processing Diagram";

/// Single OCR line covering the whole annotation
pub fn text(
    bbox: [f64; 4],
    image_bbox: [f64; 4],
    languages: &[String],
    error: Option<&ExtractionError>,
) -> TextExtraction {
    let message = match error {
        Some(e) => format!("Error processing text: {e}"),
        None => NO_TEXT_MESSAGE.to_string(),
    };

    TextExtraction::Pages(vec![OcrPage {
        text_lines: vec![TextLine {
            polygon: bbox_polygon(bbox),
            confidence: 0.0,
            text: message,
            bbox,
        }],
        languages: languages.to_vec(),
        image_bbox,
    }])
}

/// One-cell HTML table
pub fn table(error: Option<&ExtractionError>) -> TableExtraction {
    let cell = match error {
        Some(e) => format!("Error extracting table: {}", escape_html(&e.to_string())),
        None => NO_TABLE_MESSAGE.to_string(),
    };
    TableExtraction::Fragments(vec![format!("<table><tr><td>{cell}</td></tr></table>")])
}

pub fn diagram(error: Option<&ExtractionError>) -> DiagramContent {
    let description = match error {
        Some(e) => format!("Could not process diagram: {e}"),
        None => "No diagram content could be extracted".to_string(),
    };
    DiagramContent {
        heading: DIAGRAM_ERROR_HEADING.to_string(),
        description,
        annotations: vec![DiagramAnnotation {
            marking: "Error".to_string(),
            description: "Error in diagram processing".to_string(),
        }],
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
