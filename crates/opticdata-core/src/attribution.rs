//! Credit models and normalisation.
//!
//! All model math is pure and operates on the chronologically ordered
//! touch times for one order. Persistence and batching live in the
//! storage crate; this module only decides how much of a conversion
//! each touch earns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default tolerance for per-order credit sums.
pub const DEFAULT_EPSILON_CREDIT: f64 = 1e-4;
/// Default tolerance for attributed-revenue sums (cents).
pub const DEFAULT_EPSILON_REVENUE: f64 = 0.01;
/// Default time-decay half-life in days.
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModel {
    FirstClick,
    LastClick,
    Linear,
    TimeDecay,
    PositionBased,
}

impl AttributionModel {
    pub const ALL: [AttributionModel; 5] = [
        AttributionModel::FirstClick,
        AttributionModel::LastClick,
        AttributionModel::Linear,
        AttributionModel::TimeDecay,
        AttributionModel::PositionBased,
    ];

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.trim() {
            "first_click" => Ok(Self::FirstClick),
            "last_click" => Ok(Self::LastClick),
            "linear" => Ok(Self::Linear),
            "time_decay" => Ok(Self::TimeDecay),
            "position_based" => Ok(Self::PositionBased),
            other => Err(CoreError::InvalidModel(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstClick => "first_click",
            Self::LastClick => "last_click",
            Self::Linear => "linear",
            Self::TimeDecay => "time_decay",
            Self::PositionBased => "position_based",
        }
    }
}

/// Compute raw credits for touches at `touched_at` (ascending) converting
/// at `converted_at`. Returns one credit per touch; the caller is expected
/// to run [`normalize_credits`] on the result before persisting.
///
/// Time-decay weights are `2^(-(age_days)/half_life)`; a zero weight sum
/// falls back to linear.
pub fn compute_credits(
    model: AttributionModel,
    touched_at: &[DateTime<Utc>],
    converted_at: DateTime<Utc>,
    half_life_days: f64,
) -> Vec<f64> {
    let n = touched_at.len();
    if n == 0 {
        return Vec::new();
    }

    match model {
        AttributionModel::FirstClick => {
            let mut credits = vec![0.0; n];
            credits[0] = 1.0;
            credits
        }
        AttributionModel::LastClick => {
            let mut credits = vec![0.0; n];
            credits[n - 1] = 1.0;
            credits
        }
        AttributionModel::Linear => vec![1.0 / n as f64; n],
        AttributionModel::TimeDecay => {
            let weights: Vec<f64> = touched_at
                .iter()
                .map(|t| {
                    let age_days = (converted_at - *t).num_seconds() as f64 / 86_400.0;
                    // Touches after the conversion would get weight > 1;
                    // clamp age at 0 so they count as "at conversion".
                    (2.0_f64).powf(-(age_days.max(0.0)) / half_life_days)
                })
                .collect();
            let sum: f64 = weights.iter().sum();
            if sum <= 0.0 {
                return vec![1.0 / n as f64; n];
            }
            weights.into_iter().map(|w| w / sum).collect()
        }
        AttributionModel::PositionBased => match n {
            1 => vec![1.0],
            2 => vec![0.5, 0.5],
            _ => {
                let middle = 0.2 / (n - 2) as f64;
                let mut credits = vec![middle; n];
                credits[0] = 0.4;
                credits[n - 1] = 0.4;
                credits
            }
        },
    }
}

/// Rescale `credits` so positive entries sum to exactly 1.0.
///
/// Within `epsilon` of 1 the slice is left untouched. Otherwise every
/// positive credit is divided by the positive sum and the floating-point
/// residual of the rescaled sum is folded onto the single largest credit.
/// Zero and negative entries stay at 0.
pub fn normalize_credits(credits: &mut [f64], epsilon: f64) {
    for c in credits.iter_mut() {
        if *c < 0.0 {
            *c = 0.0;
        }
    }

    let sum: f64 = credits.iter().filter(|c| **c > 0.0).sum();
    if sum <= 0.0 {
        return;
    }
    if (sum - 1.0).abs() < epsilon {
        return;
    }

    for c in credits.iter_mut() {
        if *c > 0.0 {
            *c /= sum;
        }
    }

    let new_sum: f64 = credits.iter().filter(|c| **c > 0.0).sum();
    let residual = 1.0 - new_sum;
    if residual != 0.0 {
        if let Some(largest) = credits
            .iter_mut()
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        {
            *largest += residual;
        }
    }
}

/// Round to 2 decimals, the currency precision attributed revenue is
/// persisted at.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn days_ago(base: DateTime<Utc>, days: i64) -> DateTime<Utc> {
        base - Duration::days(days)
    }

    #[test]
    fn linear_splits_evenly_across_three_touches() {
        let now = Utc::now();
        let touches = vec![days_ago(now, 10), days_ago(now, 5), days_ago(now, 1)];
        let credits = compute_credits(AttributionModel::Linear, &touches, now, 7.0);
        for c in &credits {
            assert!((c - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn first_and_last_click_are_all_or_nothing() {
        let now = Utc::now();
        let touches = vec![days_ago(now, 10), days_ago(now, 5), days_ago(now, 1)];
        let first = compute_credits(AttributionModel::FirstClick, &touches, now, 7.0);
        assert_eq!(first, vec![1.0, 0.0, 0.0]);
        let last = compute_credits(AttributionModel::LastClick, &touches, now, 7.0);
        assert_eq!(last, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn time_decay_halves_every_seven_days() {
        // Touches at -14d, -7d, 0d: raw weights 0.25 / 0.5 / 1.0.
        let now = Utc::now();
        let touches = vec![days_ago(now, 14), days_ago(now, 7), now];
        let credits = compute_credits(AttributionModel::TimeDecay, &touches, now, 7.0);
        assert!((credits[0] - 0.25 / 1.75).abs() < 1e-9);
        assert!((credits[1] - 0.5 / 1.75).abs() < 1e-9);
        assert!((credits[2] - 1.0 / 1.75).abs() < 1e-9);
    }

    #[test]
    fn position_based_four_touches() {
        let now = Utc::now();
        let touches = vec![
            days_ago(now, 9),
            days_ago(now, 6),
            days_ago(now, 3),
            days_ago(now, 1),
        ];
        let credits = compute_credits(AttributionModel::PositionBased, &touches, now, 7.0);
        assert!((credits[0] - 0.4).abs() < 1e-12);
        assert!((credits[1] - 0.1).abs() < 1e-12);
        assert!((credits[2] - 0.1).abs() < 1e-12);
        assert!((credits[3] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn position_based_one_and_two_touches() {
        let now = Utc::now();
        let one = compute_credits(AttributionModel::PositionBased, &[now], now, 7.0);
        assert_eq!(one, vec![1.0]);
        let two = compute_credits(
            AttributionModel::PositionBased,
            &[days_ago(now, 1), now],
            now,
            7.0,
        );
        assert_eq!(two, vec![0.5, 0.5]);
    }

    #[test]
    fn normalize_leaves_in_tolerance_credits_alone() {
        let mut credits = vec![0.3333333, 0.3333333, 0.3333334];
        let before = credits.clone();
        normalize_credits(&mut credits, DEFAULT_EPSILON_CREDIT);
        assert_eq!(credits, before);
    }

    #[test]
    fn normalize_rescales_drifted_credits_to_one() {
        let mut credits = vec![0.5, 0.4, 0.3];
        normalize_credits(&mut credits, DEFAULT_EPSILON_CREDIT);
        let sum: f64 = credits.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn normalize_zeroes_negative_credits() {
        let mut credits = vec![-0.2, 0.5, 0.5];
        normalize_credits(&mut credits, DEFAULT_EPSILON_CREDIT);
        assert_eq!(credits[0], 0.0);
        let sum: f64 = credits.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn normalize_is_permutation_stable() {
        // Same multiset of credits normalises to the same multiset.
        let mut a = vec![0.6, 0.3, 0.3];
        let mut b = vec![0.3, 0.6, 0.3];
        normalize_credits(&mut a, DEFAULT_EPSILON_CREDIT);
        normalize_credits(&mut b, DEFAULT_EPSILON_CREDIT);
        let mut a_sorted = a.clone();
        let mut b_sorted = b.clone();
        a_sorted.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
        b_sorted.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
        assert_eq!(a_sorted, b_sorted);
    }

    #[test]
    fn round_cents_matches_currency_precision() {
        assert_eq!(round_cents(14.285714), 14.29);
        assert_eq!(round_cents(100.0 / 3.0), 33.33);
    }
}
