use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Functional feature a model may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Feature {
    Streaming,
    ToolCalling,
    StructuredOutput,
    SystemMessages,
    Multimodal,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Streaming,
        Feature::ToolCalling,
        Feature::StructuredOutput,
        Feature::SystemMessages,
        Feature::Multimodal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Streaming => "streaming",
            Feature::ToolCalling => "tool_calling",
            Feature::StructuredOutput => "structured_output",
            Feature::SystemMessages => "system_messages",
            Feature::Multimodal => "multimodal",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelType {
    Chat,
    Completion,
    Embedding,
    Image,
    Audio,
}

/// Price per 1K tokens, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Pricing {
    pub fn per_1k(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Mean of input and output price, used for ceilings and cost scoring.
    pub fn blended_per_1k(&self) -> f64 {
        (self.input_per_1k + self.output_per_1k) / 2.0
    }
}

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}

impl LatencyPercentiles {
    /// Nearest-rank percentiles over the given samples.
    pub fn from_samples(samples_ms: &[f64]) -> Self {
        let mut sorted: Vec<f64> = samples_ms.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = |p: f64| {
            let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
            sorted[idx.clamp(1, sorted.len()) - 1]
        };
        Self {
            p50_ms: rank(50.0),
            p90_ms: rank(90.0),
            p95_ms: rank(95.0),
            p99_ms: rank(99.0),
            samples: sorted.len(),
        }
    }

    pub fn is_measured(&self) -> bool {
        self.samples > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub latency: LatencyPercentiles,
    /// Output tokens per second observed during latency sampling.
    pub throughput_tokens_per_sec: f64,
    /// Fraction of latency samples that succeeded, in [0, 1].
    pub reliability: f64,
}

/// Capability snapshot for one model of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub model_id: String,
    pub model_type: ModelType,
    pub context_window: u64,
    pub max_output_tokens: u64,
    pub features: BTreeSet<Feature>,
    pub pricing: Pricing,
    pub performance: PerformanceMetrics,
}

impl ModelCapabilities {
    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendLimits {
    pub requests_per_minute: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub monthly_quota_tokens: Option<u64>,
}

/// Service-level figures used for drift comparison.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SlaMetrics {
    pub uptime: f64,
    pub latency_p95_ms: f64,
    pub error_rate: f64,
}

/// Outcome of each battery test, per model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub subtests_run: usize,
    pub subtests_completed: usize,
    pub models_enumerated: usize,
    pub models_probed: usize,
    /// `model_id -> test name -> passed`.
    pub results: BTreeMap<String, BTreeMap<String, bool>>,
}

/// Atomic snapshot of everything known about one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub backend_id: String,
    pub models: Vec<ModelCapabilities>,
    pub limits: BackendLimits,
    pub certifications: BTreeSet<String>,
    pub advertised_uptime: Option<f64>,
    /// Share of the probe battery that produced information, in [0, 1].
    pub confidence: f64,
    pub probed_at: DateTime<Utc>,
    pub report: ProbeReport,
}

impl ProviderCapabilities {
    pub fn model(&self, model_id: &str) -> Option<&ModelCapabilities> {
        self.models.iter().find(|m| m.model_id == model_id)
    }

    pub fn model_types(&self) -> BTreeSet<ModelType> {
        self.models.iter().map(|m| m.model_type).collect()
    }

    /// A feature is offered by the backend when any model supports it.
    pub fn supports(&self, feature: Feature) -> bool {
        self.models.iter().any(|m| m.supports(feature))
    }

    /// Backend-wide SLA figures: advertised uptime when published, otherwise
    /// the measured mean reliability.
    pub fn sla(&self) -> SlaMetrics {
        let measured: Vec<&ModelCapabilities> = self
            .models
            .iter()
            .filter(|m| m.performance.latency.is_measured())
            .collect();
        if measured.is_empty() {
            return SlaMetrics {
                uptime: self.advertised_uptime.unwrap_or(0.0),
                latency_p95_ms: 0.0,
                error_rate: 0.0,
            };
        }
        let n = measured.len() as f64;
        let reliability = measured.iter().map(|m| m.performance.reliability).sum::<f64>() / n;
        let latency = measured.iter().map(|m| m.performance.latency.p95_ms).sum::<f64>() / n;
        SlaMetrics {
            uptime: self.advertised_uptime.unwrap_or(reliability),
            latency_p95_ms: latency,
            error_rate: (1.0 - reliability).clamp(0.0, 1.0),
        }
    }
}
