//! Number formatting for the display
//!
//! Rounding and truncation work on the shortest decimal text of the
//! `f64` (what `{}` prints), not on scaled floats. Scaling first would
//! let representation error leak through: `4.35 * 100.0` is
//! `434.99999999999994`, which truncates to `4.34`.

use crate::config::DisplayConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumberPolicy {
    /// Nearest value, halves away from zero.
    Round,
    /// Drop everything below the last kept decimal place.
    Truncate,
}

/// Formats `value` with exactly `decimals` decimal places.
pub fn format_decimal(value: f64, decimals: usize, policy: NumberPolicy) -> String {
    if !value.is_finite() {
        return "--".to_string();
    }

    let text = format!("{}", value.abs());
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let frac: Vec<u8> = frac_part.bytes().map(|b| b - b'0').collect();

    let mut digits: Vec<u8> = int_part.bytes().map(|b| b - b'0').collect();
    digits.extend((0..decimals).map(|i| frac.get(i).copied().unwrap_or(0)));

    if policy == NumberPolicy::Round && frac.get(decimals).is_some_and(|d| *d >= 5) {
        increment(&mut digits);
    }

    let split = digits.len() - decimals;
    let mut out = String::with_capacity(digits.len() + 2);
    if value.is_sign_negative() && digits.iter().any(|d| *d != 0) {
        out.push('-');
    }
    out.extend(digits[..split].iter().map(|d| char::from(b'0' + d)));
    if decimals > 0 {
        out.push('.');
        out.extend(digits[split..].iter().map(|d| char::from(b'0' + d)));
    }
    out
}

fn increment(digits: &mut Vec<u8>) {
    for digit in digits.iter_mut().rev() {
        if *digit == 9 {
            *digit = 0;
        } else {
            *digit += 1;
            return;
        }
    }
    digits.insert(0, 1);
}

/// Power readings: base unit below the threshold, kW above it.
#[derive(Clone, Debug, PartialEq)]
pub struct PowerFormat {
    pub rescale: bool,
    pub threshold: f64,
    pub kw_decimals: usize,
    pub policy: NumberPolicy,
}

impl PowerFormat {
    pub fn from_config(display: &DisplayConfig) -> Self {
        Self {
            rescale: display.report_kw_over_threshold,
            threshold: display.kw_threshold_watts,
            kw_decimals: display.kw_decimal_places,
            policy: if display.round_numbers {
                NumberPolicy::Round
            } else {
                NumberPolicy::Truncate
            },
        }
    }

    pub fn format(&self, watts: f64) -> String {
        if self.rescale && watts.abs() >= self.threshold {
            format!(
                "{} kW",
                format_decimal(watts / 1000.0, self.kw_decimals, self.policy)
            )
        } else {
            format!("{} W", format_decimal(watts, 0, self.policy))
        }
    }
}
