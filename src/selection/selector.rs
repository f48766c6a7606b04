use crate::capability::{ModelCapabilities, ProviderCapabilities};
use crate::circuit::CircuitState;
use crate::error::DispatchError;
use crate::selection::types::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Ranks cached `(backend, model)` pairs against caller criteria.
///
/// Pure with respect to its inputs: the caller hands in the current
/// snapshots and health view, nothing is fetched or mutated here.
#[derive(Debug, Clone, Default)]
pub struct ProviderSelector {
    config: SelectionConfig,
}

impl ProviderSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Filter on hard requirements, score the survivors, and rank them.
    pub fn select(
        &self,
        criteria: &SelectionCriteria,
        snapshots: &[Arc<ProviderCapabilities>],
        health: &HashMap<String, BackendHealth>,
    ) -> Result<Selection, DispatchError> {
        check_ceilings(criteria)?;
        if snapshots.is_empty() {
            return Err(DispatchError::NoEligibleBackend {
                reason: "no capability snapshots available".to_string(),
            });
        }

        let weights = criteria
            .weights
            .as_ref()
            .unwrap_or(&self.config.weights)
            .for_priority(criteria.priority, self.config.priority_boost);

        let mut rejections: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut scored = Vec::new();
        for snapshot in snapshots {
            let backend_health = health.get(&snapshot.backend_id).copied().unwrap_or_default();
            for model in &snapshot.models {
                if let Err(reason) = check_hard_requirements(criteria, snapshot, model) {
                    debug!(
                        backend = %snapshot.backend_id,
                        model = %model.model_id,
                        reason,
                        "Candidate filtered out"
                    );
                    *rejections.entry(reason).or_insert(0) += 1;
                    continue;
                }
                scored.push(self.score_candidate(criteria, &weights, snapshot, model, backend_health));
            }
        }

        if scored.is_empty() {
            let summary = rejections
                .iter()
                .map(|(reason, count)| format!("{} ({})", reason, count))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(DispatchError::NoEligibleBackend {
                reason: format!("every candidate failed a hard requirement: {}", summary),
            });
        }

        scored.sort_by(rank_order);
        let max_alternatives = criteria
            .max_alternatives
            .unwrap_or(self.config.default_max_alternatives);
        let mut ranked = scored.into_iter();
        let Some(primary) = ranked.next() else {
            return Err(DispatchError::NoEligibleBackend {
                reason: "no candidates survived ranking".to_string(),
            });
        };
        let alternatives: Vec<ScoredCandidate> = ranked.take(max_alternatives).collect();

        info!(
            "Selected {}/{} with score {:.3}: {}",
            primary.backend_id, primary.model_id, primary.score, primary.selection_reason
        );
        Ok(Selection {
            primary,
            alternatives,
        })
    }

    fn score_candidate(
        &self,
        criteria: &SelectionCriteria,
        weights: &ScoringWeights,
        snapshot: &ProviderCapabilities,
        model: &ModelCapabilities,
        health: BackendHealth,
    ) -> ScoredCandidate {
        let performance = self.calculate_performance_score(snapshot, model);
        let cost = self.calculate_cost_score(model);
        let features = calculate_feature_score(criteria, model);
        let compliance = calculate_compliance_score(criteria, snapshot);

        let weighted = performance * weights.performance_weight
            + cost * weights.cost_weight
            + features * weights.feature_weight
            + compliance * weights.compliance_weight;

        let influence = self.config.confidence_influence.clamp(0.0, 1.0);
        let confidence_factor = 1.0 - influence * (1.0 - snapshot.confidence.clamp(0.0, 1.0));
        let health_factor = if health.deprioritized {
            self.config.health_penalty.clamp(0.0, 1.0)
        } else {
            1.0
        };

        let breakdown = ScoreBreakdown {
            performance,
            cost,
            features,
            compliance,
            confidence_factor,
            health_factor,
        };
        let circuit_open = health.circuit == CircuitState::Open;
        ScoredCandidate {
            backend_id: snapshot.backend_id.clone(),
            model_id: model.model_id.clone(),
            score: (weighted * confidence_factor * health_factor).clamp(0.0, 1.0),
            selection_reason: build_selection_reason(&breakdown, weights, circuit_open),
            breakdown,
            circuit_open,
        }
    }

    /// Latency, throughput and uptime composite.
    fn calculate_performance_score(&self, snapshot: &ProviderCapabilities, model: &ModelCapabilities) -> f64 {
        let perf = &model.performance;
        let uptime = snapshot
            .advertised_uptime
            .unwrap_or(perf.reliability)
            .clamp(0.0, 1.0);
        let split = &self.config.performance;
        if !perf.latency.is_measured() {
            return split.unmeasured_uptime_factor.clamp(0.0, 1.0) * uptime;
        }
        let latency_ref = self.config.latency_reference_ms.max(f64::EPSILON);
        let throughput_ref = self.config.throughput_reference_tps.max(f64::EPSILON);
        let latency = latency_ref / (latency_ref + perf.latency.p95_ms.max(0.0));
        let throughput = perf.throughput_tokens_per_sec.max(0.0);
        let throughput = throughput / (throughput + throughput_ref);
        let (latency_weight, throughput_weight, uptime_weight) = split.normalized();
        latency_weight * latency + throughput_weight * throughput + uptime_weight * uptime
    }

    /// Inverse of blended price, 1.0 for free models.
    fn calculate_cost_score(&self, model: &ModelCapabilities) -> f64 {
        let reference = self.config.cost_reference_per_1k.max(f64::EPSILON);
        reference / (reference + model.pricing.blended_per_1k().max(0.0))
    }
}

/// A NaN ceiling would compare false against every price and admit everything.
fn check_ceilings(criteria: &SelectionCriteria) -> Result<(), DispatchError> {
    let ceilings = [
        ("max_cost_per_1k", criteria.max_cost_per_1k),
        ("max_latency_p95_ms", criteria.max_latency_p95_ms),
    ];
    for (name, ceiling) in ceilings {
        if let Some(value) = ceiling
            && (!value.is_finite() || value < 0.0)
        {
            return Err(DispatchError::InvalidCriteria(format!(
                "{} must be finite and non-negative, got {}",
                name, value
            )));
        }
    }
    Ok(())
}

fn check_hard_requirements(
    criteria: &SelectionCriteria,
    snapshot: &ProviderCapabilities,
    model: &ModelCapabilities,
) -> Result<(), &'static str> {
    if !criteria.required_features.iter().all(|f| model.supports(*f)) {
        return Err("missing required feature");
    }
    if criteria.model_type.is_some_and(|t| t != model.model_type) {
        return Err("model type mismatch");
    }
    if criteria.min_context_window.is_some_and(|min| model.context_window < min) {
        return Err("context window too small");
    }
    if let Some(ceiling) = criteria.max_cost_per_1k {
        let price = model.pricing.blended_per_1k();
        if price.is_nan() || price > ceiling {
            return Err("above cost ceiling");
        }
    }
    if let Some(ceiling) = criteria.max_latency_p95_ms {
        let latency = &model.performance.latency;
        if !latency.is_measured() || latency.p95_ms.is_nan() || latency.p95_ms > ceiling {
            return Err("above latency ceiling");
        }
    }
    if !criteria.required_certifications.is_subset(&snapshot.certifications) {
        return Err("missing required certification");
    }
    Ok(())
}

fn calculate_feature_score(criteria: &SelectionCriteria, model: &ModelCapabilities) -> f64 {
    if criteria.optional_features.is_empty() {
        return 1.0;
    }
    let present = criteria
        .optional_features
        .iter()
        .filter(|f| model.supports(**f))
        .count();
    present as f64 / criteria.optional_features.len() as f64
}

fn calculate_compliance_score(criteria: &SelectionCriteria, snapshot: &ProviderCapabilities) -> f64 {
    let requested: Vec<&String> = criteria
        .required_certifications
        .union(&criteria.preferred_certifications)
        .collect();
    if requested.is_empty() {
        return 1.0;
    }
    let present = requested
        .iter()
        .filter(|c| snapshot.certifications.contains(c.as_str()))
        .count();
    present as f64 / requested.len() as f64
}

/// Open circuits last, then score descending, then ids for stable output.
fn rank_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    a.circuit_open
        .cmp(&b.circuit_open)
        .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
        .then_with(|| a.backend_id.cmp(&b.backend_id))
        .then_with(|| a.model_id.cmp(&b.model_id))
}

/// Human-readable explanation built from the dominant contributions.
fn build_selection_reason(breakdown: &ScoreBreakdown, weights: &ScoringWeights, circuit_open: bool) -> String {
    let mut contributions = [
        ("performance", breakdown.performance * weights.performance_weight),
        ("cost", breakdown.cost * weights.cost_weight),
        ("features", breakdown.features * weights.feature_weight),
        ("compliance", breakdown.compliance * weights.compliance_weight),
    ];
    contributions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut reasons = vec![format!(
        "strongest on {} ({:.2}) and {} ({:.2})",
        contributions[0].0, contributions[0].1, contributions[1].0, contributions[1].1
    )];
    if breakdown.confidence_factor < 1.0 {
        reasons.push(format!("confidence x{:.2}", breakdown.confidence_factor));
    }
    if breakdown.health_factor < 1.0 {
        reasons.push("deprioritized after quota or rate-limit exhaustion".to_string());
    }
    if circuit_open {
        reasons.push("circuit open".to_string());
    }
    reasons.join(", ")
}
