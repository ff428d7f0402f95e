//! Numeric interval expressions used as cohort labels.
//!
//! A cohort label in interval mode reads like `[8, 16)` or `(-inf, 16)`:
//! an opening bracket, a lower bound, a comma, an upper bound and a closing
//! bracket.  Square brackets include the bound, round brackets exclude it,
//! and the `-inf` / `inf` tokens leave that side unbounded.

use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use thiserror::Error;

/// Token accepted as the lower bound for negative infinity.
pub const NEG_INFINITY_TOKEN: &str = "-inf";
/// Token accepted as the upper bound for positive infinity.
pub const POS_INFINITY_TOKEN: &str = "inf";

/// Errors raised while parsing an interval expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntervalParseError {
    /// The expression did not start with `(` or `[`.
    #[error("interval must start with '(' or '[': {0:?}")]
    OpeningBracket(String),
    /// The expression did not end with `)` or `]`.
    #[error("interval must end with ')' or ']': {0:?}")]
    ClosingBracket(String),
    /// The body did not contain exactly one comma.
    #[error("interval must contain exactly two bounds: {0:?}")]
    BoundCount(String),
    /// A bound was neither a finite decimal nor the matching infinity token.
    #[error("invalid interval bound {0:?}")]
    InvalidBound(String),
    /// The lower bound exceeded the upper bound.
    #[error("lower bound {lower} exceeds upper bound {upper}")]
    Inverted {
        /// Parsed lower bound.
        lower: f64,
        /// Parsed upper bound.
        upper: f64,
    },
}

/// A parsed numeric interval with per-side inclusivity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    lower: Bound<f64>,
    upper: Bound<f64>,
}

impl Interval {
    /// Builds an interval from explicit bounds, rejecting inverted ranges.
    pub fn new(lower: Bound<f64>, upper: Bound<f64>) -> Result<Self, IntervalParseError> {
        if let (Some(lo), Some(hi)) = (bound_value(&lower), bound_value(&upper)) {
            if lo > hi {
                return Err(IntervalParseError::Inverted {
                    lower: lo,
                    upper: hi,
                });
            }
        }
        Ok(Self { lower, upper })
    }

    /// Lower bound of the interval.
    pub fn lower(&self) -> Bound<f64> {
        self.lower
    }

    /// Upper bound of the interval.
    pub fn upper(&self) -> Bound<f64> {
        self.upper
    }

    /// Returns true if `value` lies inside the interval.
    pub fn contains(&self, value: f64) -> bool {
        let above = match self.lower {
            Bound::Unbounded => true,
            Bound::Included(lo) => value >= lo,
            Bound::Excluded(lo) => value > lo,
        };
        let below = match self.upper {
            Bound::Unbounded => true,
            Bound::Included(hi) => value <= hi,
            Bound::Excluded(hi) => value < hi,
        };
        above && below
    }
}

impl FromStr for Interval {
    type Err = IntervalParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let inclusive_lower = match trimmed.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Err(IntervalParseError::OpeningBracket(input.to_string())),
        };
        let inclusive_upper = match trimmed.chars().last() {
            Some(']') if trimmed.len() > 1 => true,
            Some(')') if trimmed.len() > 1 => false,
            _ => return Err(IntervalParseError::ClosingBracket(input.to_string())),
        };
        let body = &trimmed[1..trimmed.len() - 1];
        let (lower_raw, upper_raw) = match body.split_once(',') {
            Some((lo, hi)) if !hi.contains(',') => (lo.trim(), hi.trim()),
            _ => return Err(IntervalParseError::BoundCount(input.to_string())),
        };

        let lower = if lower_raw == NEG_INFINITY_TOKEN {
            Bound::Unbounded
        } else {
            let value = parse_finite(lower_raw)?;
            if inclusive_lower {
                Bound::Included(value)
            } else {
                Bound::Excluded(value)
            }
        };
        let upper = if upper_raw == POS_INFINITY_TOKEN || upper_raw == "+inf" {
            Bound::Unbounded
        } else {
            let value = parse_finite(upper_raw)?;
            if inclusive_upper {
                Bound::Included(value)
            } else {
                Bound::Excluded(value)
            }
        };
        Interval::new(lower, upper)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lower {
            Bound::Unbounded => write!(f, "({NEG_INFINITY_TOKEN}, ")?,
            Bound::Included(lo) => write!(f, "[{lo}, ")?,
            Bound::Excluded(lo) => write!(f, "({lo}, ")?,
        }
        match self.upper {
            Bound::Unbounded => write!(f, "{POS_INFINITY_TOKEN})"),
            Bound::Included(hi) => write!(f, "{hi}]"),
            Bound::Excluded(hi) => write!(f, "{hi})"),
        }
    }
}

fn bound_value(bound: &Bound<f64>) -> Option<f64> {
    match bound {
        Bound::Included(v) | Bound::Excluded(v) => Some(*v),
        Bound::Unbounded => None,
    }
}

// `f64::from_str` also accepts "inf" and "NaN"; only finite decimals are bounds.
fn parse_finite(raw: &str) -> Result<f64, IntervalParseError> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(IntervalParseError::InvalidBound(raw.to_string())),
    }
}
