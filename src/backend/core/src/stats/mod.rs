//! Statistics engine: pure functions over experiment values.
//!
//! All winner and significance decisions are made here, server-side, so
//! polling clients and live-streaming clients can never disagree about the
//! outcome. Every function is deterministic: no randomness, no wall-clock
//! reads.
//!
//! The confidence test is a two-proportion pooled z-test. For a control with
//! `c` conversions over `n_c` visitors and a variant with `v` over `n_v`:
//!
//! ```text
//! p̂  = (c + v) / (n_c + n_v)
//! se = sqrt(p̂ (1 - p̂) (1/n_c + 1/n_v))
//! z  = |p_v - p_c| / se
//! confidence = (2 Φ(z) - 1) × 100
//! ```
//!
//! where Φ is the standard normal CDF. Confidence is 0 whenever either side
//! has no visitors or fewer than [`MIN_SAMPLE_SIZE`] of them, and is
//! monotonically non-decreasing in sample size for fixed observed rates.

mod analysis;

pub use analysis::{analyze, Analysis, VariantComparison};

use crate::experiment::{Experiment, Variant, VariantId};

/// Minimum visitors on each side before the z-test is considered meaningful.
pub const MIN_SAMPLE_SIZE: u64 = 30;

/// Conversion rate as a fraction in [0, 1]. Exactly 0 when there are no
/// visitors; conversions above the visitor count are clamped (a counter
/// invariant violation upstream must not surface as a rate above 1).
pub fn conversion_rate(conversions: u64, visitors: u64) -> f64 {
    if visitors == 0 {
        return 0.0;
    }
    conversions.min(visitors) as f64 / visitors as f64
}

/// Certainty (0-100) that the difference between two observed proportions is
/// not due to chance, via the two-proportion pooled z-test.
///
/// Arguments are `(conversions, visitors)` pairs for the control and the
/// variant respectively.
pub fn two_proportion_confidence(control: (u64, u64), variant: (u64, u64)) -> f64 {
    let (control_conversions, control_visitors) = control;
    let (variant_conversions, variant_visitors) = variant;

    if control_visitors < MIN_SAMPLE_SIZE || variant_visitors < MIN_SAMPLE_SIZE {
        return 0.0;
    }

    let control_conversions = control_conversions.min(control_visitors);
    let variant_conversions = variant_conversions.min(variant_visitors);

    let p_control = control_conversions as f64 / control_visitors as f64;
    let p_variant = variant_conversions as f64 / variant_visitors as f64;

    let pooled = (control_conversions + variant_conversions) as f64
        / (control_visitors + variant_visitors) as f64;
    if pooled <= 0.0 || pooled >= 1.0 {
        return 0.0;
    }

    let se = (pooled
        * (1.0 - pooled)
        * (1.0 / control_visitors as f64 + 1.0 / variant_visitors as f64))
        .sqrt();
    if se == 0.0 {
        return 0.0;
    }

    let z = (p_variant - p_control).abs() / se;
    ((2.0 * normal_cdf(z) - 1.0) * 100.0).clamp(0.0, 100.0)
}

/// Confidence of a variant against the experiment's control. The control
/// compared against itself is 0.
pub fn variant_confidence(control: &Variant, variant: &Variant) -> f64 {
    if variant.id == control.id {
        return 0.0;
    }
    two_proportion_confidence(
        (control.conversions, control.visitors),
        (variant.conversions, variant.visitors),
    )
}

/// Pick the winning variant, if one qualifies.
///
/// A non-control variant qualifies when its confidence against the control
/// reaches the experiment's `confidence_level` and its conversion rate is
/// strictly above the control's. The winner is the qualifier with the
/// strictly highest conversion rate; an exact tie at the top yields no
/// winner.
pub fn determine_winner(experiment: &Experiment) -> Option<VariantId> {
    let control = experiment.control()?;
    let control_rate = conversion_rate(control.conversions, control.visitors);

    let mut best: Option<(VariantId, f64)> = None;
    let mut tied = false;
    for variant in experiment.variants.iter().filter(|v| !v.is_control) {
        let confidence = variant_confidence(control, variant);
        if confidence < experiment.confidence_level {
            continue;
        }
        let rate = conversion_rate(variant.conversions, variant.visitors);
        if rate <= control_rate {
            continue;
        }
        match best {
            Some((_, best_rate)) if rate > best_rate => {
                best = Some((variant.id, rate));
                tied = false;
            }
            Some((_, best_rate)) if rate == best_rate => tied = true,
            Some(_) => {}
            None => best = Some((variant.id, rate)),
        }
    }

    if tied {
        None
    } else {
        best.map(|(id, _)| id)
    }
}

/// The significance number all consumers agree on: the winner's confidence,
/// or the maximum confidence over all comparisons when no variant qualifies.
pub fn experiment_significance(experiment: &Experiment) -> f64 {
    let Some(control) = experiment.control() else {
        return 0.0;
    };

    if let Some(winner_id) = determine_winner(experiment) {
        if let Some(winner) = experiment.variant(winner_id) {
            return variant_confidence(control, winner);
        }
    }

    experiment
        .variants
        .iter()
        .filter(|v| !v.is_control)
        .map(|v| variant_confidence(control, v))
        .fold(0.0, f64::max)
}

/// Return a clone of the experiment with all derived fields refreshed:
/// per-variant conversion rate and confidence, and experiment-level
/// significance. The `winner` field is left untouched; only the terminal
/// finalization path sets it.
pub fn derive(experiment: &Experiment) -> Experiment {
    let mut derived = experiment.clone();
    let control = derived.variants.iter().find(|v| v.is_control).cloned();

    for variant in &mut derived.variants {
        variant.conversions = variant.conversions.min(variant.visitors);
        variant.conversion_rate = conversion_rate(variant.conversions, variant.visitors);
        variant.confidence = match &control {
            Some(control) => variant_confidence(control, variant),
            None => 0.0,
        };
    }
    derived.statistical_significance = experiment_significance(&derived);
    derived
}

/// Standard normal cumulative distribution function.
fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Error function via the Abramowitz & Stegun rational approximation
/// (formula 7.1.26, max absolute error 1.5e-7).
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    sign * y
}
