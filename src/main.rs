// HTTP entry point for region detection and annotation dispatch

use region_dispatch::{
    core::{errors::DetectionError, types::*, Config, DispatchError},
    services::{
        detection::{DetectionModel, OnnxDetectionModel, RegionDetector},
        dispatch::{AnnotationDispatcher, AnnotationEnvelope},
        extraction::{
            AnthropicClient, ClaudeTableExtractor, LlmDiagramExtractor, LlmTextExtractor,
            OpenAiClient,
        },
    },
    utils::{decode_image_bytes, png_data_url, Metrics},
};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

type HandlerError = (StatusCode, String);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "region_dispatch={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== REGION DETECTION & ANNOTATION DISPATCH ===");
    info!(
        "Config: conf={} iou={} nms={:?} margin={}px tilt={}° pool={}",
        config.confidence_threshold(),
        config.iou_threshold(),
        config.detection.nms_policy,
        config.crop_margin(),
        config.detection.tilt_rotation.degrees(),
        config.onnx_pool_size()
    );

    // Initialize metrics
    let metrics = Metrics::new();

    info!("Loading region detector...");
    let model: Arc<dyn DetectionModel> = Arc::new(OnnxDetectionModel::load(&config.detection)?);
    let detector = Arc::new(RegionDetector::new(model, &config.detection, metrics.clone()));

    info!("Initializing extractors...");
    let openai = Arc::new(OpenAiClient::new(&config.extractors, metrics.clone())?);
    let anthropic = Arc::new(AnthropicClient::new(&config.extractors, metrics.clone())?);
    if !openai.is_configured() {
        warn!("OPENAI_API_KEY not set: TEXT and DIAGRAM annotations will return fallbacks");
    }
    if !anthropic.is_configured() {
        warn!("ANTHROPIC_API_KEY not set: TABLE annotations will return fallbacks");
    }

    let dispatcher = AnnotationDispatcher::new(
        Arc::new(LlmTextExtractor::new(openai.clone(), config.extractors.text_model.clone())),
        Arc::new(ClaudeTableExtractor::from_config(anthropic.clone(), &config.extractors)),
        Arc::new(LlmDiagramExtractor::new(openai.clone(), config.extractors.diagram_model.clone())),
        metrics.clone(),
    )
    .with_languages(config.ocr.languages.clone());

    let state = AppState {
        config: config.clone(),
        detector,
        dispatcher: Arc::new(dispatcher),
        circuit_breakers: vec![
            openai.circuit_breaker().clone(),
            anthropic.circuit_breaker().clone(),
        ],
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/detect-regions", post(detect_regions))
        .route("/mask-regions", post(mask_regions))
        .route("/crop-regions", post(crop_regions))
        .route("/process-annotation", post(process_annotation))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.server.max_upload_bytes))
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                   - Root endpoint");
    info!("  GET  /health             - Health check");
    info!("  GET  /metrics            - Prometheus metrics");
    info!("  GET  /stats              - Detailed statistics");
    info!("  POST /detect-regions     - Detect table regions (multipart: file)");
    info!("  POST /mask-regions       - White out detected regions (multipart: file)");
    info!("  POST /crop-regions       - High-res crops (multipart: file, high_res)");
    info!("  POST /process-annotation - Extract content for one annotation (JSON)");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Region Detection & Annotation Dispatch"
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    state.metrics.record_endpoint_request("/health");
    let breakers: Vec<_> = state.circuit_breakers.iter().map(|b| b.stats()).collect();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "detector_backend": state.detector.backend(),
        "extractors": state.dispatcher.extractor_names(),
        "circuit_breakers": breakers,
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Json<Value> {
    let params = state.detector.params();
    let breakers: Vec<_> = state.circuit_breakers.iter().map(|b| b.stats()).collect();
    Json(json!({
        "metrics": state.metrics.snapshot(),
        "circuit_breakers": breakers,
        "detection": {
            "confidence_threshold": params.confidence_threshold,
            "iou_threshold": params.iou_threshold,
            "nms_policy": format!("{:?}", params.nms),
            "crop_margin": state.config.crop_margin(),
        },
    }))
}

/// Detect regions endpoint
///
/// # Request Format:
/// - multipart/form-data
/// - Field "file": page image (PNG/JPEG)
///
/// # Response:
/// - `{bbox_data, num_detections, width, height}`
async fn detect_regions(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DetectionResponse>, HandlerError> {
    state.metrics.record_endpoint_request("/detect-regions");
    let mut files = read_files(multipart).await?;
    let page = take_file(&mut files, "file")?;

    let detector = state.detector.clone();
    let result = run_blocking(move || {
        let image = decode_image_bytes(&page).map_err(bad_request)?;
        detector.detect(&image).map_err(internal)
    })
    .await?;

    info!("Detected {} regions", result.boxes.len());
    Ok(Json(DetectionResponse::from(result)))
}

/// Mask regions endpoint: the page with every detected region painted white
async fn mask_regions(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, HandlerError> {
    state.metrics.record_endpoint_request("/mask-regions");
    let mut files = read_files(multipart).await?;
    let page = take_file(&mut files, "file")?;

    let detector = state.detector.clone();
    let masked = run_blocking(move || {
        let image = decode_image_bytes(&page).map_err(bad_request)?;
        let masked = detector.mask_detected_regions(&image).map_err(internal)?;
        png_data_url(&masked).map_err(internal)
    })
    .await?;

    Ok(Json(json!({ "masked_image": masked })))
}

/// Crop regions endpoint
///
/// # Request Format:
/// - Field "file": low-resolution page used for detection
/// - Field "high_res": the same page at full resolution
async fn crop_regions(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, HandlerError> {
    state.metrics.record_endpoint_request("/crop-regions");
    let mut files = read_files(multipart).await?;
    let low = take_file(&mut files, "file")?;
    let high = take_file(&mut files, "high_res")?;

    let detector = state.detector.clone();
    let response = run_blocking(move || {
        let low = decode_image_bytes(&low).map_err(bad_request)?;
        let high = decode_image_bytes(&high).map_err(bad_request)?;
        let result = detector
            .crop_regions_at_high_resolution(&low, &high)
            .map_err(internal)?;

        let crops = result
            .crops
            .iter()
            .map(|crop| {
                Ok(json!({
                    "detection": crop.detection,
                    "tilt_corrected": crop.tilt_corrected,
                    "width": crop.image.width(),
                    "height": crop.image.height(),
                    "image": png_data_url(&crop.image).map_err(internal)?,
                }))
            })
            .collect::<Result<Vec<_>, HandlerError>>()?;

        Ok(json!({
            "num_crops": crops.len(),
            "tilt_corrected": result.tilt_corrected,
            "skipped": result.skipped,
            "crops": crops,
        }))
    })
    .await?;

    Ok(Json(response))
}

/// Process annotation endpoint
///
/// Always answers 200 with `{success: true, annotation_id, result}`;
/// failures are reported inside `result`.
async fn process_annotation(State(state): State<AppState>, body: Bytes) -> Json<AnnotationEnvelope> {
    state.metrics.record_endpoint_request("/process-annotation");
    let envelope = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => state.dispatcher.handle_json(value).await,
        Err(e) => state.dispatcher.reject(
            Value::Null,
            DispatchError::InvalidRequest(format!("body is not valid JSON: {}", e)),
        ),
    };
    Json(envelope)
}

async fn read_files(mut multipart: Multipart) -> Result<HashMap<String, Bytes>, HandlerError> {
    let mut files = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
        files.insert(name, data);
    }
    Ok(files)
}

fn take_file(files: &mut HashMap<String, Bytes>, name: &str) -> Result<Bytes, HandlerError> {
    files
        .remove(name)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("Missing file field '{}'", name)))
}

/// Run CPU-bound detection work off the async runtime
async fn run_blocking<T, F>(work: F) -> Result<T, HandlerError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, HandlerError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| internal(DetectionError::TaskJoinFailed(e.to_string())))?
}

fn bad_request(e: impl std::fmt::Display) -> HandlerError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn internal(e: impl std::fmt::Display) -> HandlerError {
    error!("Request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
