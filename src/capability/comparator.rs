use crate::capability::types::{Feature, ProviderCapabilities};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;

/// Relative weight of each comparison dimension. Normalized on use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonWeights {
    pub model_types: f64,
    pub features: f64,
    pub sla: f64,
    pub certifications: f64,
}

impl Default for ComparisonWeights {
    fn default() -> Self {
        Self {
            model_types: 0.3,
            features: 0.3,
            sla: 0.2,
            certifications: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DifferenceCategory {
    ModelTypes,
    Features,
    Sla,
    Certifications,
}

/// One field on which two snapshots disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDifference {
    pub path: String,
    pub a: Value,
    pub b: Value,
    pub impact: Impact,
    pub category: DifferenceCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityComparison {
    /// Similarity in [0, 1]; symmetric in its arguments.
    pub score: f64,
    pub differences: Vec<CapabilityDifference>,
    pub recommendation: String,
}

impl CapabilityComparison {
    pub fn high_impact(&self) -> impl Iterator<Item = &CapabilityDifference> {
        self.differences.iter().filter(|d| d.impact == Impact::High)
    }
}

/// Similarity score plus itemized diff between two capability snapshots.
pub fn compare(
    a: &ProviderCapabilities,
    b: &ProviderCapabilities,
    weights: &ComparisonWeights,
) -> CapabilityComparison {
    let mut differences = Vec::new();

    let types_a = a.model_types();
    let types_b = b.model_types();
    let type_similarity = jaccard(&types_a, &types_b);
    for model_type in types_a.symmetric_difference(&types_b) {
        differences.push(CapabilityDifference {
            path: format!("model_types.{:?}", model_type),
            a: json!(types_a.contains(model_type)),
            b: json!(types_b.contains(model_type)),
            impact: Impact::Low,
            category: DifferenceCategory::ModelTypes,
        });
    }

    let mut agreeing = 0usize;
    for feature in Feature::ALL {
        let (in_a, in_b) = (a.supports(feature), b.supports(feature));
        if in_a == in_b {
            agreeing += 1;
        } else {
            differences.push(CapabilityDifference {
                path: format!("features.{}", feature),
                a: json!(in_a),
                b: json!(in_b),
                impact: feature_impact(feature),
                category: DifferenceCategory::Features,
            });
        }
    }
    let feature_agreement = agreeing as f64 / Feature::ALL.len() as f64;

    let (sla_a, sla_b) = (a.sla(), b.sla());
    let sla_fields = [
        ("sla.uptime", sla_a.uptime, sla_b.uptime, Impact::High),
        ("sla.latency_p95_ms", sla_a.latency_p95_ms, sla_b.latency_p95_ms, Impact::Medium),
        ("sla.error_rate", sla_a.error_rate, sla_b.error_rate, Impact::Medium),
    ];
    let mut closeness_sum = 0.0;
    for (path, va, vb, impact) in sla_fields {
        let closeness = closeness(va, vb);
        closeness_sum += closeness;
        if closeness < 1.0 {
            differences.push(CapabilityDifference {
                path: path.to_string(),
                a: json!(va),
                b: json!(vb),
                impact,
                category: DifferenceCategory::Sla,
            });
        }
    }
    let sla_closeness = closeness_sum / sla_fields.len() as f64;

    let cert_similarity = jaccard(&a.certifications, &b.certifications);
    for certification in a.certifications.symmetric_difference(&b.certifications) {
        differences.push(CapabilityDifference {
            path: format!("certifications.{}", certification),
            a: json!(a.certifications.contains(certification)),
            b: json!(b.certifications.contains(certification)),
            impact: Impact::Low,
            category: DifferenceCategory::Certifications,
        });
    }

    let total = weights.model_types + weights.features + weights.sla + weights.certifications;
    let score = if total > 0.0 {
        (weights.model_types * type_similarity
            + weights.features * feature_agreement
            + weights.sla * sla_closeness
            + weights.certifications * cert_similarity)
            / total
    } else {
        0.0
    };
    let score = score.clamp(0.0, 1.0);

    CapabilityComparison {
        score,
        recommendation: recommendation(score, &differences),
        differences,
    }
}

fn feature_impact(feature: Feature) -> Impact {
    match feature {
        Feature::Streaming | Feature::ToolCalling | Feature::Multimodal => Impact::High,
        Feature::StructuredOutput | Feature::SystemMessages => Impact::Low,
    }
}

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// `1 - |a - b| / max(|a|, |b|)`, 1 when both are zero.
fn closeness(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 || !scale.is_finite() {
        return if a == b { 1.0 } else { 0.0 };
    }
    (1.0 - (a - b).abs() / scale).clamp(0.0, 1.0)
}

fn recommendation(score: f64, differences: &[CapabilityDifference]) -> String {
    let high = differences.iter().filter(|d| d.impact == Impact::High).count();
    if differences.is_empty() {
        "equivalent: fully interchangeable".to_string()
    } else if score >= 0.9 && high == 0 {
        "equivalent: interchangeable for most workloads".to_string()
    } else if score >= 0.7 {
        format!("similar: suitable as fallback after checking {} high-impact difference(s)", high)
    } else if score >= 0.4 {
        "partially compatible: verify required features before failing over".to_string()
    } else {
        "incompatible: do not use as a substitute".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closeness_bounds() {
        assert_eq!(closeness(0.0, 0.0), 1.0);
        assert_eq!(closeness(100.0, 100.0), 1.0);
        assert_eq!(closeness(100.0, 50.0), 0.5);
        assert_eq!(closeness(0.0, 5.0), 0.0);
        assert_eq!(closeness(-1.0, 1.0), 0.0);
    }

    #[test]
    fn test_jaccard_of_empty_sets_is_one() {
        let empty: BTreeSet<u8> = BTreeSet::new();
        assert_eq!(jaccard(&empty, &empty), 1.0);
        let a: BTreeSet<u8> = [1, 2].into();
        let b: BTreeSet<u8> = [2, 3].into();
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-12);
    }
}
