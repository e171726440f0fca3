use image::DynamicImage;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::core::config::ExtractorConfig;
use crate::core::errors::{ExtractResult, ExtractionError};
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::utils::{encode_png_base64, png_data_url, Metrics};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// JSON-over-HTTP client with retries, a circuit breaker and metrics.
///
/// One instance per backend service; the breaker trips for the whole
/// service, not per model.
pub struct ApiClient {
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
    metrics: Metrics,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl ApiClient {
    pub fn new(service: &str, config: &ExtractorConfig, metrics: Metrics) -> ExtractResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            circuit_breaker: CircuitBreaker::new(service, CircuitBreakerConfig::from(config)),
            metrics,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
        })
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// POST `body` and return the parsed JSON response
    #[instrument(skip(self, headers, body), fields(service = %self.circuit_breaker.service()))]
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &Value,
    ) -> ExtractResult<Value> {
        let permit = match self.circuit_breaker.admit() {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Circuit breaker is open, failing fast");
                return Err(e);
            }
        };

        let start = Instant::now();
        let result = self.send_with_retries(url, headers, body).await;
        let duration = start.elapsed();

        match result {
            Ok(response) => {
                permit.succeed();
                let (input_tokens, output_tokens) = extract_token_usage(&response);
                self.metrics
                    .record_api_call(true, duration, input_tokens, output_tokens);
                debug!(
                    "API call completed in {:.2}ms ({} in / {} out tokens)",
                    duration.as_secs_f64() * 1000.0,
                    input_tokens,
                    output_tokens
                );
                Ok(response)
            }
            Err(e) => {
                if permit.fail() {
                    self.metrics.record_circuit_breaker_trip();
                }
                self.metrics.record_api_call(false, duration, 0, 0);
                Err(e)
            }
        }
    }

    async fn send_with_retries(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &Value,
    ) -> ExtractResult<Value> {
        let mut attempt = 0;

        loop {
            let mut request = self.http_client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            let err = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response.json::<Value>().await.map_err(|e| {
                        ExtractionError::InvalidResponse(format!("response body is not JSON: {e}"))
                    });
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    ExtractionError::ApiStatus { status, body }
                }
                Err(e) => ExtractionError::from(e),
            };

            if attempt >= self.max_retries || !is_retryable(&err) {
                return Err(err);
            }

            let delay = self.backoff(attempt, &err);
            debug!(
                "API request failed: {}. Retrying in {:?} ({}/{})",
                err,
                delay,
                attempt + 1,
                self.max_retries
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Long fixed wait for rate limits and overload, exponential with
    /// jitter otherwise
    fn backoff(&self, attempt: u32, err: &ExtractionError) -> Duration {
        let base = self.retry_base_delay;
        if matches!(err, ExtractionError::ApiStatus { status: 429 | 503, .. }) {
            return base.saturating_mul(10);
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        base.saturating_mul(2u32.saturating_pow(attempt)) + Duration::from_millis(jitter_ms)
    }
}

fn is_retryable(err: &ExtractionError) -> bool {
    match err {
        ExtractionError::ApiStatus { status, .. } => *status == 429 || *status >= 500,
        ExtractionError::ApiRequestFailed(_) => true,
        _ => false,
    }
}

/// Token counts from either OpenAI (`prompt_tokens`) or Anthropic
/// (`input_tokens`) usage blocks
fn extract_token_usage(response: &Value) -> (u64, u64) {
    let usage = &response["usage"];
    let input_tokens = usage["prompt_tokens"]
        .as_u64()
        .or_else(|| usage["input_tokens"].as_u64())
        .unwrap_or(0);
    let output_tokens = usage["completion_tokens"]
        .as_u64()
        .or_else(|| usage["output_tokens"].as_u64())
        .unwrap_or(0);

    (input_tokens, output_tokens)
}

/// Chat completion with a JSON-schema constrained answer about one image
pub struct StructuredRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub prompt: &'a str,
    pub image: &'a DynamicImage,
    pub schema_name: &'a str,
    pub schema: Value,
    pub temperature: f32,
}

/// OpenAI-compatible chat completions backend
pub struct OpenAiClient {
    api: ApiClient,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &ExtractorConfig, metrics: Metrics) -> ExtractResult<Self> {
        Ok(Self {
            api: ApiClient::new("openai", config, metrics)?,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        self.api.circuit_breaker()
    }

    /// Send the request and deserialize the model's JSON answer into `T`
    pub async fn structured<T: DeserializeOwned>(
        &self,
        extractor: &'static str,
        request: StructuredRequest<'_>,
    ) -> ExtractResult<T> {
        let api_key = self.api_key.as_deref().ok_or(ExtractionError::NotConfigured {
            extractor,
            missing: "OPENAI_API_KEY",
        })?;

        let data_url = png_data_url(request.image)?;
        let body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "messages": [
                {"role": "system", "content": request.system},
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": request.prompt},
                        {"type": "image_url", "image_url": {"url": data_url}}
                    ]
                }
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "strict": true,
                    "schema": request.schema
                }
            }
        });

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .api
            .post_json(&url, &[("Authorization", format!("Bearer {api_key}"))], &body)
            .await?;

        let message = &response["choices"][0]["message"];
        if let Some(refusal) = message["refusal"].as_str() {
            return Err(ExtractionError::InvalidResponse(format!(
                "model refused: {refusal}"
            )));
        }
        let content = message["content"]
            .as_str()
            .ok_or_else(|| ExtractionError::InvalidResponse("missing message content".to_string()))?;

        serde_json::from_str(content).map_err(|e| {
            ExtractionError::InvalidResponse(format!("answer does not match {}: {e}", request.schema_name))
        })
    }
}

/// Messages request carrying one PNG image
pub struct MessageRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub prompt: &'a str,
    pub image: &'a DynamicImage,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Anthropic messages backend
pub struct AnthropicClient {
    api: ApiClient,
    base_url: String,
    api_key: Option<String>,
}

impl AnthropicClient {
    pub fn new(config: &ExtractorConfig, metrics: Metrics) -> ExtractResult<Self> {
        Ok(Self {
            api: ApiClient::new("anthropic", config, metrics)?,
            base_url: config.anthropic_base_url.trim_end_matches('/').to_string(),
            api_key: config.anthropic_api_key.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        self.api.circuit_breaker()
    }

    /// Send the request and return the concatenated text blocks of the reply
    pub async fn message(
        &self,
        extractor: &'static str,
        request: MessageRequest<'_>,
    ) -> ExtractResult<String> {
        let api_key = self.api_key.as_deref().ok_or(ExtractionError::NotConfigured {
            extractor,
            missing: "ANTHROPIC_API_KEY",
        })?;

        let image_data = encode_png_base64(request.image)?;
        let body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": request.prompt},
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/png",
                            "data": image_data
                        }
                    }
                ]
            }]
        });

        let url = format!("{}/messages", self.base_url);
        let headers = [
            ("x-api-key", api_key.to_string()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];
        let response = self.api.post_json(&url, &headers, &body).await?;

        let blocks = response["content"]
            .as_array()
            .ok_or_else(|| ExtractionError::InvalidResponse("missing content blocks".to_string()))?;
        let text: String = blocks
            .iter()
            .filter(|block| block["type"] == "text")
            .filter_map(|block| block["text"].as_str())
            .collect();

        if text.trim().is_empty() {
            return Err(ExtractionError::EmptyResult);
        }
        Ok(text)
    }
}
