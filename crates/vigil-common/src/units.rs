//! Dimensions and scales of metric values.
//!
//! The engine works in canonical units (bytes, seconds, single counts);
//! [`Units::scale`] gives the factor that converts a raw value into them.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SPACE_BYTE: u8 = 0;
pub const SPACE_KBYTE: u8 = 1;
pub const SPACE_MBYTE: u8 = 2;
pub const SPACE_GBYTE: u8 = 3;
pub const SPACE_TBYTE: u8 = 4;

pub const TIME_NSEC: u8 = 0;
pub const TIME_USEC: u8 = 1;
pub const TIME_MSEC: u8 = 2;
pub const TIME_SEC: u8 = 3;
pub const TIME_MIN: u8 = 4;
pub const TIME_HOUR: u8 = 5;

const SPACE_NAMES: [&str; 7] = ["byte", "Kbyte", "Mbyte", "Gbyte", "Tbyte", "Pbyte", "Ebyte"];
const TIME_NAMES: [&str; 6] = ["nsec", "usec", "msec", "sec", "min", "hour"];
const TIME_FACTORS: [f64; 6] = [1e-9, 1e-6, 1e-3, 1.0, 60.0, 3600.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Units {
    #[serde(default)]
    pub dim_space: i8,
    #[serde(default)]
    pub dim_time: i8,
    #[serde(default)]
    pub dim_count: i8,
    #[serde(default)]
    pub scale_space: u8,
    #[serde(default)]
    pub scale_time: u8,
    #[serde(default)]
    pub scale_count: i8,
}

impl Units {
    pub const NONE: Units = Units {
        dim_space: 0,
        dim_time: 0,
        dim_count: 0,
        scale_space: 0,
        scale_time: 0,
        scale_count: 0,
    };

    /// Units of a plain count, as produced by the `count_*` aggregations.
    pub fn count() -> Self {
        Units {
            dim_count: 1,
            ..Units::NONE
        }
    }

    pub fn bytes() -> Self {
        Units {
            dim_space: 1,
            scale_space: SPACE_BYTE,
            ..Units::NONE
        }
    }

    pub fn seconds() -> Self {
        Units {
            dim_time: 1,
            scale_time: TIME_SEC,
            ..Units::NONE
        }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dim_space == 0 && self.dim_time == 0 && self.dim_count == 0
    }

    /// Same dimensions expressed in canonical scales.
    pub fn canon(&self) -> Units {
        Units {
            dim_space: self.dim_space,
            dim_time: self.dim_time,
            dim_count: self.dim_count,
            scale_space: SPACE_BYTE,
            scale_time: if self.dim_time != 0 { TIME_SEC } else { 0 },
            scale_count: 0,
        }
    }

    /// Factor converting a value in these units into canonical units.
    pub fn scale(&self) -> f64 {
        let mut f = 1.0;
        if self.dim_space != 0 {
            f *= 1024f64.powi(self.scale_space as i32 * self.dim_space as i32);
        }
        if self.dim_time != 0 {
            let idx = (self.scale_time as usize).min(TIME_FACTORS.len() - 1);
            f *= TIME_FACTORS[idx].powi(self.dim_time as i32);
        }
        if self.dim_count != 0 {
            f *= 10f64.powi(self.scale_count as i32 * self.dim_count as i32);
        }
        f
    }

    /// Units of `self * other`; both must already be canonical.
    pub fn product(&self, other: &Units) -> Units {
        Units {
            dim_space: self.dim_space + other.dim_space,
            dim_time: self.dim_time + other.dim_time,
            dim_count: self.dim_count + other.dim_count,
            ..Units::NONE
        }
        .canon()
    }

    /// Units of `self / other`; both must already be canonical.
    pub fn quotient(&self, other: &Units) -> Units {
        Units {
            dim_space: self.dim_space - other.dim_space,
            dim_time: self.dim_time - other.dim_time,
            dim_count: self.dim_count - other.dim_count,
            ..Units::NONE
        }
        .canon()
    }

    /// Units after differentiating with respect to time.
    pub fn per_second(&self) -> Units {
        Units {
            dim_time: self.dim_time - 1,
            ..*self
        }
        .canon()
    }

    /// Units after undoing a rate conversion.
    pub fn times_second(&self) -> Units {
        Units {
            dim_time: self.dim_time + 1,
            ..*self
        }
        .canon()
    }
}

fn push_dim(num: &mut Vec<String>, den: &mut Vec<String>, name: &str, dim: i8) {
    let term = |d: i8| {
        if d == 1 {
            name.to_string()
        } else {
            format!("{name}^{d}")
        }
    };
    if dim > 0 {
        num.push(term(dim));
    } else if dim < 0 {
        den.push(term(-dim));
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut num = Vec::new();
        let mut den = Vec::new();
        let space = SPACE_NAMES
            .get(self.scale_space as usize)
            .copied()
            .unwrap_or("byte");
        let time = TIME_NAMES
            .get(self.scale_time as usize)
            .copied()
            .unwrap_or("sec");
        let count = if self.scale_count == 0 {
            "count".to_string()
        } else {
            format!("count x 10^{}", self.scale_count)
        };
        push_dim(&mut num, &mut den, space, self.dim_space);
        push_dim(&mut num, &mut den, time, self.dim_time);
        push_dim(&mut num, &mut den, &count, self.dim_count);

        match (num.is_empty(), den.is_empty()) {
            (true, true) => Ok(()),
            (false, true) => write!(f, "{}", num.join(" ")),
            (true, false) => write!(f, "/ {}", den.join(" ")),
            (false, false) => write!(f, "{} / {}", num.join(" "), den.join(" ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kbyte_per_msec_scales_to_bytes_per_second() {
        let u = Units {
            dim_space: 1,
            dim_time: -1,
            scale_space: SPACE_KBYTE,
            scale_time: TIME_MSEC,
            ..Units::NONE
        };
        assert!((u.scale() - 1024.0 * 1000.0).abs() < 1e-6);
        assert_eq!(u.canon().to_string(), "byte / sec");
    }

    #[test]
    fn product_and_quotient_combine_dimensions() {
        let rate = Units::bytes().per_second();
        assert_eq!(rate.product(&Units::seconds()), Units::bytes());
        assert_eq!(Units::bytes().quotient(&Units::seconds()), rate);
        assert!(Units::count().quotient(&Units::count()).is_dimensionless());
    }

    #[test]
    fn minutes_scale_to_seconds() {
        let u = Units {
            dim_time: 1,
            scale_time: TIME_MIN,
            ..Units::NONE
        };
        assert_eq!(u.scale(), 60.0);
        assert_eq!(Units::NONE.scale(), 1.0);
        assert_eq!(Units::NONE.to_string(), "");
    }
}
