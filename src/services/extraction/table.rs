use async_trait::async_trait;
use image::DynamicImage;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, instrument, warn};

use super::api_client::{AnthropicClient, MessageRequest};
use super::{TableExtraction, TableExtractor};
use crate::core::config::ExtractorConfig;
use crate::core::errors::{ExtractResult, ExtractionError};

/// Used when no prompt file is deployed next to the binary
pub const DEFAULT_TABLE_SYSTEM_PROMPT: &str = "You convert images of tables into HTML.
Work through the table step by step: count rows and columns, note merged cells, then read every cell.
When you are done, write the complete table once inside <final></final> tags, with the opening
<table> tag on the line directly after <final>. Use rowspan and colspan for merged cells and
reproduce cell text exactly as printed.";

static FINAL_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<final>\n<table(.*?)</final>").unwrap_or_else(|e| unreachable!("{e}"))
});

/// Pull every `<final>`-wrapped table out of a model answer, closing the
/// `<table>` element when the answer left it open
pub fn extract_html_tables(content: &str) -> Vec<String> {
    FINAL_TABLE
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|block| {
            let block = block.as_str();
            if block.trim_end().ends_with("</table>") {
                format!("<table{block}")
            } else {
                format!("<table{block}</table>")
            }
        })
        .collect()
}

/// TABLE extractor backed by an Anthropic vision model
pub struct ClaudeTableExtractor {
    client: Arc<AnthropicClient>,
    model: String,
    system_prompt: String,
    max_tokens: u32,
}

impl ClaudeTableExtractor {
    pub fn new(
        client: Arc<AnthropicClient>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt: system_prompt.into(),
            max_tokens,
        }
    }

    /// Build from config, reading the system prompt from disk when present
    pub fn from_config(client: Arc<AnthropicClient>, config: &ExtractorConfig) -> Self {
        let system_prompt = match std::fs::read_to_string(&config.table_system_prompt_path) {
            Ok(prompt) if !prompt.trim().is_empty() => prompt,
            Ok(_) => {
                warn!("Table prompt {} is empty, using built-in prompt", config.table_system_prompt_path);
                DEFAULT_TABLE_SYSTEM_PROMPT.to_string()
            }
            Err(e) => {
                warn!(
                    "Could not read table prompt {}: {}. Using built-in prompt",
                    config.table_system_prompt_path, e
                );
                DEFAULT_TABLE_SYSTEM_PROMPT.to_string()
            }
        };
        Self::new(client, config.table_model.clone(), system_prompt, config.table_max_tokens)
    }
}

#[async_trait]
impl TableExtractor for ClaudeTableExtractor {
    fn name(&self) -> &str {
        "claude-table"
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn extract(&self, image: &DynamicImage) -> ExtractResult<TableExtraction> {
        let answer = self
            .client
            .message(
                "table",
                MessageRequest {
                    model: &self.model,
                    system: &self.system_prompt,
                    prompt: "Extract the table step by step.",
                    image,
                    max_tokens: self.max_tokens,
                    temperature: 0.0,
                },
            )
            .await?;

        let tables = extract_html_tables(&answer);
        debug!("Parsed {} table(s) from {} chars of answer", tables.len(), answer.len());
        if tables.is_empty() {
            return Err(ExtractionError::EmptyResult);
        }
        Ok(TableExtraction::Fragments(tables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::utils::Metrics;
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parses_closed_and_open_tables() {
        let answer = "Rows: 2, columns: 1.\n\
            <final>\n<table><tr><td>a</td></tr></table>\n</final>\n\
            and another\n\
            <final>\n<table border=\"1\"><tr><td>b</td></tr>\n</final>";

        let tables = extract_html_tables(answer);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0], "<table><tr><td>a</td></tr></table>\n");
        assert_eq!(tables[1], "<table border=\"1\"><tr><td>b</td></tr>\n</table>");
    }

    #[test]
    fn test_ignores_tables_outside_final() {
        assert!(extract_html_tables("<table><tr><td>draft</td></tr></table>").is_empty());
        // The table must start on the line right after <final>
        assert!(extract_html_tables("<final><table></table></final>").is_empty());
    }

    #[test]
    fn test_missing_prompt_file_uses_builtin_prompt() {
        let mut config = Config::default().extractors;
        config.table_system_prompt_path = "/nonexistent/table_prompt.txt".to_string();
        let client = Arc::new(AnthropicClient::new(&config, Metrics::new()).unwrap());
        let extractor = ClaudeTableExtractor::from_config(client, &config);
        assert_eq!(extractor.system_prompt, DEFAULT_TABLE_SYSTEM_PROMPT);
        assert_eq!(extractor.max_tokens, 16000);
    }

    async fn extractor_answering(server: &MockServer, answer: &str) -> ClaudeTableExtractor {
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": answer}],
                "usage": {"input_tokens": 100, "output_tokens": 40}
            })))
            .mount(server)
            .await;

        let mut config = Config::default().extractors;
        config.anthropic_api_key = Some("ak-test".to_string());
        config.anthropic_base_url = server.uri();
        let client = Arc::new(AnthropicClient::new(&config, Metrics::new()).unwrap());
        ClaudeTableExtractor::new(client, "claude-test", "prompt", 256)
    }

    fn white() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])))
    }

    #[tokio::test]
    async fn test_extract_returns_legacy_fragments() {
        let server = MockServer::start().await;
        let extractor =
            extractor_answering(&server, "<final>\n<table><tr><td>42</td></tr></table></final>").await;

        let result = extractor.extract(&white()).await.unwrap();
        assert_eq!(
            result,
            TableExtraction::Fragments(vec!["<table><tr><td>42</td></tr></table>".to_string()])
        );
    }

    #[tokio::test]
    async fn test_answer_without_table_is_empty_result() {
        let server = MockServer::start().await;
        let extractor = extractor_answering(&server, "I could not find a table.").await;
        assert!(matches!(
            extractor.extract(&white()).await,
            Err(ExtractionError::EmptyResult)
        ));
    }
}
