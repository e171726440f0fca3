use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per series; older samples are discarded
const MAX_LATENCY_SAMPLES: usize = 4096;

/// Metrics collector for detection, dispatch and extractor traffic.
///
/// Cheap to clone; every clone records into the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Detection
    detections_total: AtomicUsize,
    regions_detected: AtomicUsize,
    detection_latency_ms: RwLock<Vec<u64>>,
    crops_total: AtomicUsize,
    tilt_corrections: AtomicUsize,

    // Annotation dispatch
    annotations_by_type: DashMap<String, AtomicUsize>,
    fallbacks_by_type: DashMap<String, AtomicUsize>,
    annotation_errors: AtomicUsize,

    // Extractor API calls
    api_calls_total: AtomicUsize,
    api_calls_success: AtomicUsize,
    api_calls_failed: AtomicUsize,
    api_tokens_input: AtomicU64,
    api_tokens_output: AtomicU64,
    api_latency_ms: RwLock<Vec<u64>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    circuit_breaker_trips: AtomicUsize,

    start_time: Instant,
}

fn push_sample(samples: &RwLock<Vec<u64>>, duration: Duration) {
    let mut samples = samples.write();
    if samples.len() >= MAX_LATENCY_SAMPLES {
        samples.remove(0);
    }
    samples.push(duration.as_millis() as u64);
}

fn bump(counters: &DashMap<String, AtomicUsize>, key: &str) {
    counters
        .entry(key.to_string())
        .or_insert_with(|| AtomicUsize::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn collect(counters: &DashMap<String, AtomicUsize>) -> BTreeMap<String, usize> {
    counters
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect()
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                detections_total: AtomicUsize::new(0),
                regions_detected: AtomicUsize::new(0),
                detection_latency_ms: RwLock::new(Vec::new()),
                crops_total: AtomicUsize::new(0),
                tilt_corrections: AtomicUsize::new(0),
                annotations_by_type: DashMap::new(),
                fallbacks_by_type: DashMap::new(),
                annotation_errors: AtomicUsize::new(0),
                api_calls_total: AtomicUsize::new(0),
                api_calls_success: AtomicUsize::new(0),
                api_calls_failed: AtomicUsize::new(0),
                api_tokens_input: AtomicU64::new(0),
                api_tokens_output: AtomicU64::new(0),
                api_latency_ms: RwLock::new(Vec::new()),
                endpoint_counters: DashMap::new(),
                circuit_breaker_trips: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Detection Metrics
    pub fn record_detection(&self, regions: usize, duration: Duration) {
        self.inner.detections_total.fetch_add(1, Ordering::Relaxed);
        self.inner.regions_detected.fetch_add(regions, Ordering::Relaxed);
        push_sample(&self.inner.detection_latency_ms, duration);
    }

    pub fn record_crops(&self, crops: usize, tilted: usize) {
        self.inner.crops_total.fetch_add(crops, Ordering::Relaxed);
        self.inner.tilt_corrections.fetch_add(tilted, Ordering::Relaxed);
    }

    // Dispatch Metrics
    pub fn record_annotation(&self, kind: &str) {
        bump(&self.inner.annotations_by_type, kind);
    }

    pub fn record_fallback(&self, kind: &str) {
        bump(&self.inner.fallbacks_by_type, kind);
    }

    pub fn record_annotation_error(&self) {
        self.inner.annotation_errors.fetch_add(1, Ordering::Relaxed);
    }

    // API Metrics
    pub fn record_api_call(&self, success: bool, duration: Duration, input_tokens: u64, output_tokens: u64) {
        self.inner.api_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.api_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.api_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.api_tokens_input.fetch_add(input_tokens, Ordering::Relaxed);
        self.inner.api_tokens_output.fetch_add(output_tokens, Ordering::Relaxed);
        push_sample(&self.inner.api_latency_ms, duration);
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        bump(&self.inner.endpoint_counters, endpoint);
    }

    // Circuit Breaker Metrics
    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let detection_latency = self.inner.detection_latency_ms.read();
        let detection_latency_avg_ms = avg(&detection_latency);
        let detection_latency_p95_ms = percentile(&detection_latency, 0.95);
        drop(detection_latency);

        let api_latency = self.inner.api_latency_ms.read();
        let api_latency_avg_ms = avg(&api_latency);
        let api_latency_p50_ms = percentile(&api_latency, 0.5);
        let api_latency_p95_ms = percentile(&api_latency, 0.95);
        let api_latency_p99_ms = percentile(&api_latency, 0.99);
        drop(api_latency);

        MetricsSnapshot {
            detections_total: self.inner.detections_total.load(Ordering::Relaxed),
            regions_detected: self.inner.regions_detected.load(Ordering::Relaxed),
            detection_latency_avg_ms,
            detection_latency_p95_ms,
            crops_total: self.inner.crops_total.load(Ordering::Relaxed),
            tilt_corrections: self.inner.tilt_corrections.load(Ordering::Relaxed),
            annotations_by_type: collect(&self.inner.annotations_by_type),
            fallbacks_by_type: collect(&self.inner.fallbacks_by_type),
            annotation_errors: self.inner.annotation_errors.load(Ordering::Relaxed),
            api_calls_total: self.inner.api_calls_total.load(Ordering::Relaxed),
            api_calls_success: self.inner.api_calls_success.load(Ordering::Relaxed),
            api_calls_failed: self.inner.api_calls_failed.load(Ordering::Relaxed),
            api_tokens_input: self.inner.api_tokens_input.load(Ordering::Relaxed),
            api_tokens_output: self.inner.api_tokens_output.load(Ordering::Relaxed),
            api_latency_avg_ms,
            api_latency_p50_ms,
            api_latency_p95_ms,
            api_latency_p99_ms,
            endpoint_requests: collect(&self.inner.endpoint_counters),
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let mut metric = |name: &str, kind: &str, help: &str, samples: Vec<(String, String)>| {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            for (labels, value) in samples {
                let _ = writeln!(out, "{}{} {}", name, labels, value);
            }
            out.push('\n');
        };
        let plain = |value: String| vec![(String::new(), value)];
        let labeled = |label: &str, map: &BTreeMap<String, usize>| {
            map.iter()
                .map(|(k, v)| (format!("{{{}=\"{}\"}}", label, k), v.to_string()))
                .collect::<Vec<_>>()
        };

        metric("detections_total", "counter", "Detection passes run", plain(s.detections_total.to_string()));
        metric("regions_detected_total", "counter", "Boxes surviving NMS", plain(s.regions_detected.to_string()));
        metric(
            "detection_latency_avg_ms",
            "gauge",
            "Average detection latency in milliseconds",
            plain(s.detection_latency_avg_ms.to_string()),
        );
        metric("crops_total", "counter", "High-resolution crops produced", plain(s.crops_total.to_string()));
        metric(
            "tilt_corrections_total",
            "counter",
            "Crops rotated because the detector flagged tilt",
            plain(s.tilt_corrections.to_string()),
        );
        metric(
            "annotations_total",
            "counter",
            "Annotations dispatched by type",
            labeled("type", &s.annotations_by_type),
        );
        metric(
            "annotation_fallbacks_total",
            "counter",
            "Annotations answered with a fallback result",
            labeled("type", &s.fallbacks_by_type),
        );
        metric(
            "annotation_errors_total",
            "counter",
            "Annotations answered with an error result",
            plain(s.annotation_errors.to_string()),
        );
        metric("api_calls_total", "counter", "Extractor API calls", plain(s.api_calls_total.to_string()));
        metric("api_calls_failed_total", "counter", "Failed extractor API calls", plain(s.api_calls_failed.to_string()));
        metric("api_tokens_input_total", "counter", "Total input tokens consumed", plain(s.api_tokens_input.to_string()));
        metric("api_tokens_output_total", "counter", "Total output tokens generated", plain(s.api_tokens_output.to_string()));
        metric(
            "api_latency_avg_ms",
            "gauge",
            "Average extractor API latency in milliseconds",
            plain(s.api_latency_avg_ms.to_string()),
        );
        metric(
            "http_requests_total",
            "counter",
            "Requests by endpoint",
            labeled("endpoint", &s.endpoint_requests),
        );
        metric(
            "circuit_breaker_trips_total",
            "counter",
            "Total circuit breaker trips",
            plain(s.circuit_breaker_trips.to_string()),
        );
        metric("uptime_seconds", "counter", "Application uptime in seconds", plain(s.uptime_seconds.to_string()));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub detections_total: usize,
    pub regions_detected: usize,
    pub detection_latency_avg_ms: u64,
    pub detection_latency_p95_ms: u64,
    pub crops_total: usize,
    pub tilt_corrections: usize,
    pub annotations_by_type: BTreeMap<String, usize>,
    pub fallbacks_by_type: BTreeMap<String, usize>,
    pub annotation_errors: usize,
    pub api_calls_total: usize,
    pub api_calls_success: usize,
    pub api_calls_failed: usize,
    pub api_tokens_input: u64,
    pub api_tokens_output: u64,
    pub api_latency_avg_ms: u64,
    pub api_latency_p50_ms: u64,
    pub api_latency_p95_ms: u64,
    pub api_latency_p99_ms: u64,
    pub endpoint_requests: BTreeMap<String, usize>,
    pub circuit_breaker_trips: usize,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_api_call(true, Duration::from_millis(100), 500, 200);
        metrics.record_api_call(false, Duration::from_millis(50), 0, 0);
        metrics.record_detection(3, Duration::from_millis(40));
        metrics.record_crops(3, 1);
        metrics.record_annotation("table");
        metrics.record_annotation("table");
        metrics.record_fallback("text");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.api_calls_total, 2);
        assert_eq!(snapshot.api_calls_success, 1);
        assert_eq!(snapshot.api_calls_failed, 1);
        assert_eq!(snapshot.api_tokens_input, 500);
        assert_eq!(snapshot.api_latency_avg_ms, 75);
        assert_eq!(snapshot.regions_detected, 3);
        assert_eq!(snapshot.tilt_corrections, 1);
        assert_eq!(snapshot.annotations_by_type.get("table"), Some(&2));
        assert_eq!(snapshot.fallbacks_by_type.get("text"), Some(&1));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.record_circuit_breaker_trip();
        assert_eq!(metrics.snapshot().circuit_breaker_trips, 1);
    }

    #[test]
    fn test_latency_samples_are_bounded() {
        let metrics = Metrics::new();
        for _ in 0..(MAX_LATENCY_SAMPLES + 10) {
            metrics.record_detection(0, Duration::from_millis(1));
        }
        assert_eq!(metrics.inner.detection_latency_ms.read().len(), MAX_LATENCY_SAMPLES);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_api_call(true, Duration::from_millis(100), 500, 200);
        metrics.record_annotation("diagram");
        metrics.record_endpoint_request("/detect-regions");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("api_calls_total 1"));
        assert!(prometheus.contains("api_tokens_input_total 500"));
        assert!(prometheus.contains("annotations_total{type=\"diagram\"} 1"));
        assert!(prometheus.contains("http_requests_total{endpoint=\"/detect-regions\"} 1"));
    }
}
