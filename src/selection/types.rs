use crate::capability::{Feature, ModelType};
use crate::circuit::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Dimension the caller cares about most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Balanced,
    Cost,
    Performance,
    Features,
    Compliance,
}

/// Relative weight of each scoring dimension. Normalized on use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub performance_weight: f64,
    pub cost_weight: f64,
    pub feature_weight: f64,
    pub compliance_weight: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            performance_weight: 0.25,
            cost_weight: 0.25,
            feature_weight: 0.25,
            compliance_weight: 0.25,
        }
    }
}

impl ScoringWeights {
    /// Weights summing to 1. Negative entries count as zero; all-zero falls
    /// back to equal weighting.
    pub fn normalized(&self) -> Self {
        let parts = [
            self.performance_weight.max(0.0),
            self.cost_weight.max(0.0),
            self.feature_weight.max(0.0),
            self.compliance_weight.max(0.0),
        ];
        let total: f64 = parts.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return Self::default();
        }
        Self {
            performance_weight: parts[0] / total,
            cost_weight: parts[1] / total,
            feature_weight: parts[2] / total,
            compliance_weight: parts[3] / total,
        }
    }

    /// Shift `boost` of the remaining weight toward the prioritized
    /// dimension, scaling the others down proportionally.
    pub fn for_priority(&self, priority: Priority, boost: f64) -> Self {
        let base = self.normalized();
        let boost = boost.clamp(0.0, 1.0);
        let shift = |own: f64, favored: bool| {
            if favored {
                own + boost * (1.0 - own)
            } else {
                own * (1.0 - boost)
            }
        };
        if priority == Priority::Balanced {
            return base;
        }
        Self {
            performance_weight: shift(base.performance_weight, priority == Priority::Performance),
            cost_weight: shift(base.cost_weight, priority == Priority::Cost),
            feature_weight: shift(base.feature_weight, priority == Priority::Features),
            compliance_weight: shift(base.compliance_weight, priority == Priority::Compliance),
        }
    }
}

/// Split of the performance score between its terms. Normalized on use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceWeights {
    pub latency: f64,
    pub throughput: f64,
    pub uptime: f64,
    /// Fraction of uptime credited to a model with no latency samples.
    pub unmeasured_uptime_factor: f64,
}

impl Default for PerformanceWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            throughput: 0.3,
            uptime: 0.3,
            unmeasured_uptime_factor: 0.3,
        }
    }
}

impl PerformanceWeights {
    /// `(latency, throughput, uptime)` summing to 1; defaults when unusable.
    pub fn normalized(&self) -> (f64, f64, f64) {
        let parts = [self.latency.max(0.0), self.throughput.max(0.0), self.uptime.max(0.0)];
        let total: f64 = parts.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return Self::default().normalized();
        }
        (parts[0] / total, parts[1] / total, parts[2] / total)
    }
}

/// Tuning constants for the selector. Every value here is a heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub weights: ScoringWeights,
    #[serde(default)]
    pub performance: PerformanceWeights,
    /// Share of the non-prioritized weight moved to the declared priority.
    pub priority_boost: f64,
    /// p95 latency at which the latency term scores 0.5.
    pub latency_reference_ms: f64,
    /// Throughput at which the throughput term scores 0.5.
    pub throughput_reference_tps: f64,
    /// Blended price at which the cost score is 0.5.
    pub cost_reference_per_1k: f64,
    /// How much a low-confidence snapshot is discounted, in [0, 1].
    pub confidence_influence: f64,
    /// Score multiplier for backends flagged for quota or rate-limit exhaustion.
    pub health_penalty: f64,
    pub default_max_alternatives: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            performance: PerformanceWeights::default(),
            priority_boost: 0.5,
            latency_reference_ms: 1000.0,
            throughput_reference_tps: 50.0,
            cost_reference_per_1k: 0.01,
            confidence_influence: 0.2,
            health_penalty: 0.5,
            default_max_alternatives: 3,
        }
    }
}

/// Caller requirements (hard filters) and preferences (scored).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    pub required_features: BTreeSet<Feature>,
    pub optional_features: BTreeSet<Feature>,
    pub model_type: Option<ModelType>,
    pub min_context_window: Option<u64>,
    /// Ceiling on the blended input/output price per 1K tokens.
    pub max_cost_per_1k: Option<f64>,
    /// Ceiling on measured p95 latency. Unmeasured models never pass it.
    pub max_latency_p95_ms: Option<f64>,
    pub required_certifications: BTreeSet<String>,
    pub preferred_certifications: BTreeSet<String>,
    pub priority: Priority,
    /// Replaces the configured weights for this request.
    pub weights: Option<ScoringWeights>,
    pub max_alternatives: Option<usize>,
}

impl SelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_feature(mut self, feature: Feature) -> Self {
        self.required_features.insert(feature);
        self
    }

    pub fn prefer_feature(mut self, feature: Feature) -> Self {
        self.optional_features.insert(feature);
        self
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = Some(model_type);
        self
    }

    pub fn with_min_context_window(mut self, tokens: u64) -> Self {
        self.min_context_window = Some(tokens);
        self
    }

    pub fn with_max_cost_per_1k(mut self, ceiling: f64) -> Self {
        self.max_cost_per_1k = Some(ceiling);
        self
    }

    pub fn with_max_latency_p95_ms(mut self, ceiling: f64) -> Self {
        self.max_latency_p95_ms = Some(ceiling);
        self
    }

    pub fn require_certification(mut self, certification: impl Into<String>) -> Self {
        self.required_certifications.insert(certification.into());
        self
    }

    pub fn prefer_certification(mut self, certification: impl Into<String>) -> Self {
        self.preferred_certifications.insert(certification.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_max_alternatives(mut self, max_alternatives: usize) -> Self {
        self.max_alternatives = Some(max_alternatives);
        self
    }
}

/// Health signals the selector folds into ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendHealth {
    pub circuit: CircuitState,
    /// Quota exhausted or rate-limit retries recently exhausted.
    pub deprioritized: bool,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            circuit: CircuitState::Closed,
            deprioritized: false,
        }
    }
}

/// Per-dimension scores of one candidate, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub performance: f64,
    pub cost: f64,
    pub features: f64,
    pub compliance: f64,
    pub confidence_factor: f64,
    pub health_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub backend_id: String,
    pub model_id: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    /// Ranked behind every candidate whose circuit admits calls.
    pub circuit_open: bool,
    pub selection_reason: String,
}

/// Best candidate plus ranked fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub primary: ScoredCandidate,
    pub alternatives: Vec<ScoredCandidate>,
}

impl Selection {
    /// Primary followed by alternatives, in rank order.
    pub fn candidates(&self) -> impl Iterator<Item = &ScoredCandidate> {
        std::iter::once(&self.primary).chain(self.alternatives.iter())
    }
}
