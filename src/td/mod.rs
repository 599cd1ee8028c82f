//! Semi-Markov temporal-difference error.
//!
//! A decision interval that lasted `k` ticks is scored as
//! ```text
//! δ = R + γ^k · Q(s', o') − Q(s, o)
//! ```
//! where `R` is the reward accrued over the interval, already discounted to
//! the interval start. Because option durations vary per invocation, `k` is
//! the *measured* duration, never assumed to be 1.
//!
//! [`DiscountMode::Integrated`] replaces the multiplicative discount with a
//! cost that grows linearly with the interval:
//! ```text
//! δ = R + Q(s', o') − Q(s, o) − ρ · max(Q(s, o), 0) · k
//! ```
//! as if the previous estimate were integrated over the interval at rate ρ.

use log::trace;
use serde::{Deserialize, Serialize};

/// Raw SMDP TD error.
///
/// `elapsed_ticks = 0` is treated as 1: a zero-length interval would
/// otherwise cancel the bootstrap discount entirely.
pub fn compute_error(
    value_before: f64,
    value_after: f64,
    reward: f64,
    discount: f64,
    elapsed_ticks: u64,
) -> f64 {
    let k = effective_ticks(elapsed_ticks);
    reward + discount.powi(k) * value_after - value_before
}

/// SMDP TD error with an integrated discount at `rate` per tick.
///
/// Negative estimates are not charged, so they cannot be driven further up
/// by a negative discount term.
pub fn compute_integrated_error(
    value_before: f64,
    value_after: f64,
    reward: f64,
    rate: f64,
    elapsed_ticks: u64,
) -> f64 {
    let k = f64::from(effective_ticks(elapsed_ticks));
    reward + value_after - value_before - rate * value_before.max(0.0) * k
}

/// How the bootstrap is discounted over an interval.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountMode {
    /// `γ^k` on the next estimate, with γ the level's discount
    #[default]
    Multiplicative,
    /// Subtract `rate · max(Q, 0) · k`; the level's γ only discounts rewards
    Integrated { rate: f64 },
}

/// Elapsed ticks after the zero clamp, as an exponent.
fn effective_ticks(elapsed_ticks: u64) -> i32 {
    if elapsed_ticks == 0 {
        trace!("zero-length decision interval, discounting as one tick");
        1
    } else {
        elapsed_ticks.min(i32::MAX as u64) as i32
    }
}

/// One computed error, with the inputs that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TdError {
    pub value_before: f64,
    pub value_after: f64,
    pub reward: f64,
    pub discount: f64,
    /// Ticks as measured, before the zero clamp
    pub elapsed_ticks: u64,
    /// Formula output
    pub raw: f64,
    /// Error actually used for learning (after clip and bias)
    pub error: f64,
}

/// Computes TD errors and applies optional shaping.
///
/// Shaping follows the error node of the neural model:
/// - `clip` bounds the error symmetrically
/// - `negative_value_bias` is added when the estimate being corrected is
///   negative, nudging such estimates back up
///
/// With the defaults both are inactive and `error == raw`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TdErrorComputer {
    pub clip: Option<f64>,
    pub negative_value_bias: f64,
    pub discount_mode: DiscountMode,
}

impl TdErrorComputer {
    pub fn new(clip: Option<f64>, negative_value_bias: f64) -> Self {
        Self {
            clip,
            negative_value_bias,
            discount_mode: DiscountMode::Multiplicative,
        }
    }

    pub fn with_discount_mode(mut self, discount_mode: DiscountMode) -> Self {
        self.discount_mode = discount_mode;
        self
    }

    pub fn compute(
        &self,
        value_before: f64,
        value_after: f64,
        reward: f64,
        discount: f64,
        elapsed_ticks: u64,
    ) -> TdError {
        let raw = match self.discount_mode {
            DiscountMode::Multiplicative => {
                compute_error(value_before, value_after, reward, discount, elapsed_ticks)
            }
            DiscountMode::Integrated { rate } => {
                compute_integrated_error(value_before, value_after, reward, rate, elapsed_ticks)
            }
        };
        TdError {
            value_before,
            value_after,
            reward,
            discount,
            elapsed_ticks,
            raw,
            error: self.shape(raw, value_before),
        }
    }

    fn shape(&self, raw: f64, value_before: f64) -> f64 {
        let mut error = match self.clip {
            Some(cap) if cap > 0.0 => raw.clamp(-cap, cap),
            _ => raw,
        };
        if value_before < 0.0 {
            error += self.negative_value_bias;
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula() {
        let e = compute_error(0.5, 1.0, 0.2, 0.9, 2);
        assert!((e - (0.2 + 0.81 - 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_pure_time_decay_without_reward() {
        for &gamma in &[0.1, 0.5, 0.9, 0.99, 1.0] {
            for k in 1..20u64 {
                for &v in &[-2.0, 0.0, 0.3, 5.0] {
                    let e = compute_error(v, v, 0.0, gamma, k);
                    let expected = v * (gamma.powi(k as i32) - 1.0);
                    assert!((e - expected).abs() < 1e-12);
                    if v >= 0.0 {
                        assert!(e <= 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn test_zero_elapsed_is_clamped_to_one() {
        assert_eq!(
            compute_error(1.0, 2.0, 0.5, 0.8, 0),
            compute_error(1.0, 2.0, 0.5, 0.8, 1)
        );
    }

    #[test]
    fn test_longer_intervals_discount_more() {
        let short = compute_error(0.0, 1.0, 0.0, 0.9, 1);
        let long = compute_error(0.0, 1.0, 0.0, 0.9, 10);
        assert!(long < short);
    }

    #[test]
    fn test_default_shaping_is_identity() {
        let td = TdErrorComputer::default().compute(-0.4, 0.1, 3.0, 0.5, 3);
        assert_eq!(td.raw, td.error);
        assert_eq!(td.elapsed_ticks, 3);
    }

    #[test]
    fn test_clip_and_bias() {
        let c = TdErrorComputer::new(Some(0.2), 0.03);
        let td = c.compute(0.0, 0.0, 5.0, 0.9, 1);
        assert!((td.error - 0.2).abs() < 1e-12);
        let td = c.compute(-1.0, -1.0, 0.0, 1.0, 1);
        assert!((td.raw - 0.0).abs() < 1e-12);
        assert!((td.error - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_integrated_discount_grows_linearly() {
        let one = compute_integrated_error(0.5, 0.5, 0.0, 0.1, 1);
        let four = compute_integrated_error(0.5, 0.5, 0.0, 0.1, 4);
        assert!((one + 0.05).abs() < 1e-12);
        assert!((four + 0.2).abs() < 1e-12);
        // zero-length intervals are charged one tick
        assert_eq!(
            compute_integrated_error(0.5, 0.5, 0.0, 0.1, 0),
            compute_integrated_error(0.5, 0.5, 0.0, 0.1, 1)
        );
    }

    #[test]
    fn test_integrated_discount_ignores_negative_estimates() {
        let e = compute_integrated_error(-1.0, -1.0, 0.0, 0.5, 10);
        assert_eq!(e, 0.0);
    }

    #[test]
    fn test_computer_uses_configured_mode() {
        let c = TdErrorComputer::default()
            .with_discount_mode(DiscountMode::Integrated { rate: 0.2 });
        let td = c.compute(1.0, 1.0, 0.3, 0.9, 2);
        assert!((td.raw - (0.3 - 0.4)).abs() < 1e-12);
        let plain = TdErrorComputer::default().compute(1.0, 1.0, 0.3, 0.9, 2);
        assert!((plain.raw - (0.3 + 0.81 - 1.0)).abs() < 1e-12);
    }
}
