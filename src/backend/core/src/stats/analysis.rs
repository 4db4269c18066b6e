//! Full statistical evaluation of an experiment: per-variant comparisons,
//! qualifying winner, significance, and advisory recommendations.

use serde::{Deserialize, Serialize};

use super::{conversion_rate, determine_winner, variant_confidence};
use crate::experiment::{Experiment, VariantId};

/// Total visitors below which results are flagged as unreliable.
const LOW_SAMPLE_THRESHOLD: u64 = 1000;

/// Comparison of one non-control variant against the control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantComparison {
    pub variant_id: VariantId,
    pub variant_name: String,
    pub visitors: u64,
    pub conversions: u64,
    /// Conversion rate as a fraction in [0, 1].
    pub conversion_rate: f64,
    /// Absolute rate difference vs the control.
    pub improvement: f64,
    /// Improvement relative to the control rate, in percent.
    pub relative_improvement: f64,
    /// Two-proportion z-test certainty (0-100).
    pub confidence: f64,
}

/// Result of a full experiment evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    /// Winner's confidence, or the best comparison when nothing qualifies.
    pub significance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<VariantId>,
    pub results: Vec<VariantComparison>,
    pub recommendations: Vec<String>,
}

/// Evaluate an experiment. Pure: the record is not mutated, and identical
/// inputs always produce identical output.
pub fn analyze(experiment: &Experiment) -> Analysis {
    if experiment.variants.len() < 2 {
        return Analysis {
            significance: 0.0,
            winner: None,
            results: vec![],
            recommendations: vec!["Not enough variants for analysis".to_string()],
        };
    }

    let Some(control) = experiment.control() else {
        return Analysis {
            significance: 0.0,
            winner: None,
            results: vec![],
            recommendations: vec!["No control variant found".to_string()],
        };
    };

    let control_rate = conversion_rate(control.conversions, control.visitors);
    let results: Vec<VariantComparison> = experiment
        .variants
        .iter()
        .filter(|v| !v.is_control)
        .map(|variant| {
            let rate = conversion_rate(variant.conversions, variant.visitors);
            let improvement = rate - control_rate;
            let relative_improvement = if control_rate > 0.0 {
                (improvement / control_rate) * 100.0
            } else {
                0.0
            };
            VariantComparison {
                variant_id: variant.id,
                variant_name: variant.name.clone(),
                visitors: variant.visitors,
                conversions: variant.conversions.min(variant.visitors),
                conversion_rate: rate,
                improvement,
                relative_improvement,
                confidence: variant_confidence(control, variant),
            }
        })
        .collect();

    let winner = determine_winner(experiment);
    let significance = match winner {
        Some(id) => results
            .iter()
            .find(|r| r.variant_id == id)
            .map(|r| r.confidence)
            .unwrap_or(0.0),
        None => results.iter().map(|r| r.confidence).fold(0.0, f64::max),
    };

    let recommendations = recommendations(experiment, &results, winner);

    Analysis {
        significance,
        winner,
        results,
        recommendations,
    }
}

/// Advisory strings summarizing the evaluation.
fn recommendations(
    experiment: &Experiment,
    results: &[VariantComparison],
    winner: Option<VariantId>,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if results.is_empty() {
        recommendations.push("Run the experiment longer to collect more data".to_string());
        return recommendations;
    }

    match winner.and_then(|id| results.iter().find(|r| r.variant_id == id)) {
        Some(best) => {
            recommendations.push(format!(
                "Variant \"{}\" shows a significant improvement of {:.1}%",
                best.variant_name, best.relative_improvement
            ));
            recommendations.push("Consider implementing the winning variant".to_string());
        }
        None => {
            recommendations.push("No statistically significant results yet".to_string());
            recommendations
                .push("Consider increasing sample size or extending the test duration".to_string());
        }
    }

    let total_visitors: u64 = experiment.variants.iter().map(|v| v.visitors).sum();
    if total_visitors < LOW_SAMPLE_THRESHOLD {
        recommendations.push(
            "Low sample size detected; consider running the test longer for more reliable results"
                .to_string(),
        );
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentSpec, MetricGoal, MetricSpec, MetricType, VariantSpec};

    fn experiment(control: (u64, u64), variant: (u64, u64)) -> Experiment {
        let spec = ExperimentSpec {
            name: "Pricing page".to_string(),
            description: String::new(),
            variants: vec![
                VariantSpec {
                    name: "Control".to_string(),
                    description: String::new(),
                    traffic_percentage: 50.0,
                    is_control: true,
                },
                VariantSpec {
                    name: "Annual default".to_string(),
                    description: String::new(),
                    traffic_percentage: 50.0,
                    is_control: false,
                },
            ],
            metrics: vec![MetricSpec {
                name: "Upgrade".to_string(),
                metric_type: MetricType::Conversion,
                goal: MetricGoal::Maximize,
                baseline: 0.0,
                target: 0.0,
            }],
            target_audience: String::new(),
            duration_days: 14,
            traffic_allocation: 100.0,
            confidence_level: 95.0,
        };
        let mut experiment = Experiment::from_spec(spec).unwrap();
        experiment.variants[0].visitors = control.1;
        experiment.variants[0].conversions = control.0;
        experiment.variants[1].visitors = variant.1;
        experiment.variants[1].conversions = variant.0;
        experiment
    }

    #[test]
    fn test_analyze_with_clear_winner() {
        let analysis = analyze(&experiment((50, 1000), (80, 1000)));
        assert!(analysis.winner.is_some());
        assert!(analysis.significance >= 95.0);
        assert_eq!(analysis.results.len(), 1);
        let comparison = &analysis.results[0];
        assert!((comparison.improvement - 0.03).abs() < 1e-9);
        assert!((comparison.relative_improvement - 60.0).abs() < 1e-6);
        assert!(analysis.recommendations[0].contains("Annual default"));
    }

    #[test]
    fn test_analyze_without_winner_recommends_more_data() {
        let analysis = analyze(&experiment((5, 100), (8, 100)));
        assert!(analysis.winner.is_none());
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.contains("No statistically significant results")));
        // 200 total visitors is well below the reliability threshold.
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.contains("Low sample size")));
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let experiment = experiment((50, 1000), (80, 1000));
        let first = analyze(&experiment);
        let second = analyze(&experiment);
        assert_eq!(first.winner, second.winner);
        assert_eq!(first.significance, second.significance);
        assert_eq!(first.recommendations, second.recommendations);
    }
}
