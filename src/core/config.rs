use crate::core::annotation::Rotation;
use crate::core::errors::ConfigError;
use crate::services::detection::decoder::NmsPolicy;
use crate::services::detection::geometry::{DEFAULT_CROP_MARGIN, DEFAULT_TILT_ROTATION};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    pub max_upload_bytes: usize,
}

/// Detection configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub detector_model_path: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Model input size used when the model declares dynamic spatial dims
    pub target_size: u32,
    /// Margin in pixels added around every high-resolution crop
    pub crop_margin: u32,
    pub nms_policy: NmsPolicy,
    /// Counter-clockwise turn applied to regions classified as tilted
    pub tilt_rotation: Rotation,
    pub inference_backend: Option<String>,
    /// Number of ONNX sessions (controls inference parallelism)
    pub onnx_pool_size: usize,
}

/// Extractor backend configuration
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub text_model: String,
    pub diagram_model: String,
    pub table_model: String,
    pub table_system_prompt_path: String,
    pub table_max_tokens: u32,
    pub request_timeout: Duration,
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries
    pub retry_base_delay: Duration,
    pub circuit_failure_threshold: usize,
    pub circuit_reset_timeout: Duration,
}

/// OCR configuration
#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// Language hints passed to OCR engines and echoed on TEXT results
    pub languages: Vec<String>,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub extractors: ExtractorConfig,
    pub ocr: OcrConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_secret(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Self {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let nms_policy = if env_or("NMS_CLASS_AGNOSTIC", true) {
            NmsPolicy::ClassAgnostic
        } else {
            NmsPolicy::PerClass
        };

        let tilt_degrees: i64 = env_or("TILT_ROTATION_DEGREES", 270);
        let tilt_rotation = Rotation::from_degrees(tilt_degrees).unwrap_or(DEFAULT_TILT_ROTATION);

        let languages: Vec<String> = env::var("OCR_LANGUAGES")
            .ok()
            .map(|langs| {
                langs
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .filter(|langs: &Vec<String>| !langs.is_empty())
            .unwrap_or_else(|| vec!["en".to_string()]);

        Self {
            server: ServerConfig {
                port: env_or("SERVER_PORT", 3002),
                host: env_string("SERVER_HOST", "0.0.0.0"),
                log_level,
                max_upload_bytes: env_or("MAX_UPLOAD_MB", 50usize) * 1024 * 1024,
            },
            detection: DetectionConfig {
                detector_model_path: env_string("DETECTOR_MODEL_PATH", "models/table_detector.onnx"),
                confidence_threshold: env_or("CONFIDENCE_THRESHOLD", 0.35),
                iou_threshold: env_or("IOU_THRESHOLD", 0.45),
                target_size: env_or("TARGET_SIZE", 640),
                crop_margin: env_or("CROP_MARGIN", DEFAULT_CROP_MARGIN),
                nms_policy,
                tilt_rotation,
                inference_backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
                onnx_pool_size: env::var("ONNX_POOL_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| std::cmp::min(num_cpus::get(), 4)),
            },
            extractors: ExtractorConfig {
                openai_api_key: env_secret("OPENAI_API_KEY"),
                openai_base_url: env_string("OPENAI_BASE_URL", "https://api.openai.com/v1"),
                anthropic_api_key: env_secret("ANTHROPIC_API_KEY"),
                anthropic_base_url: env_string("ANTHROPIC_BASE_URL", "https://api.anthropic.com/v1"),
                text_model: env_string("TEXT_MODEL", "gpt-4o"),
                diagram_model: env_string("DIAGRAM_MODEL", "gpt-4o"),
                table_model: env_string("TABLE_MODEL", "claude-3-7-sonnet-latest"),
                table_system_prompt_path: env_string("TABLE_SYSTEM_PROMPT_PATH", "system_prompt.txt"),
                table_max_tokens: env_or("TABLE_MAX_TOKENS", 16000),
                request_timeout: Duration::from_secs(env_or("API_TIMEOUT_SECONDS", 60)),
                max_retries: env_or("MAX_RETRIES", 3),
                retry_base_delay: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 1000)),
                circuit_failure_threshold: env_or("CIRCUIT_FAILURE_THRESHOLD", 5),
                circuit_reset_timeout: Duration::from_secs(env_or("CIRCUIT_RESET_SECONDS", 60)),
            },
            ocr: OcrConfig { languages },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let detection = &self.detection;

        // A zero threshold would keep every row of the tensor
        if !(detection.confidence_threshold > 0.0 && detection.confidence_threshold <= 1.0) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                detection.confidence_threshold,
            ));
        }

        if !(detection.iou_threshold > 0.0 && detection.iou_threshold <= 1.0) {
            return Err(ConfigError::InvalidIoUThreshold(detection.iou_threshold));
        }

        if !(32..=4096).contains(&detection.target_size) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "target_size must be between 32 and 4096, got {}",
                detection.target_size
            )));
        }

        if detection.crop_margin > 1000 {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "crop_margin must be at most 1000, got {}",
                detection.crop_margin
            )));
        }

        if detection.onnx_pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(detection.onnx_pool_size));
        }

        let extractors = &self.extractors;
        if extractors.table_max_tokens == 0 {
            return Err(ConfigError::InvalidExtractorConfig(
                "table_max_tokens must be > 0".to_string(),
            ));
        }

        if extractors.circuit_failure_threshold == 0 {
            return Err(ConfigError::InvalidExtractorConfig(
                "circuit_failure_threshold must be > 0".to_string(),
            ));
        }

        if extractors.request_timeout.is_zero() {
            return Err(ConfigError::InvalidExtractorConfig(
                "request timeout must be > 0 seconds".to_string(),
            ));
        }

        if self.ocr.languages.is_empty() {
            return Err(ConfigError::InvalidExtractorConfig(
                "at least one OCR language is required".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.detection.confidence_threshold
    }

    pub fn iou_threshold(&self) -> f32 {
        self.detection.iou_threshold
    }

    pub fn target_size(&self) -> u32 {
        self.detection.target_size
    }

    pub fn crop_margin(&self) -> u32 {
        self.detection.crop_margin
    }

    pub fn onnx_pool_size(&self) -> usize {
        self.detection.onnx_pool_size
    }
}

impl Default for Config {
    /// Built-in defaults without reading the environment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3002,
                host: "0.0.0.0".to_string(),
                log_level: Level::INFO,
                max_upload_bytes: 50 * 1024 * 1024,
            },
            detection: DetectionConfig {
                detector_model_path: "models/table_detector.onnx".to_string(),
                confidence_threshold: 0.35,
                iou_threshold: 0.45,
                target_size: 640,
                crop_margin: DEFAULT_CROP_MARGIN,
                nms_policy: NmsPolicy::ClassAgnostic,
                tilt_rotation: DEFAULT_TILT_ROTATION,
                inference_backend: None,
                onnx_pool_size: 1,
            },
            extractors: ExtractorConfig {
                openai_api_key: None,
                openai_base_url: "https://api.openai.com/v1".to_string(),
                anthropic_api_key: None,
                anthropic_base_url: "https://api.anthropic.com/v1".to_string(),
                text_model: "gpt-4o".to_string(),
                diagram_model: "gpt-4o".to_string(),
                table_model: "claude-3-7-sonnet-latest".to_string(),
                table_system_prompt_path: "system_prompt.txt".to_string(),
                table_max_tokens: 16000,
                request_timeout: Duration::from_secs(60),
                max_retries: 3,
                retry_base_delay: Duration::from_millis(1000),
                circuit_failure_threshold: 5,
                circuit_reset_timeout: Duration::from_secs(60),
            },
            ocr: OcrConfig {
                languages: vec!["en".to_string()],
            },
        }
    }
}
