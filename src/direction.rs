//! Axis motion directions and force classification.
//!
//! The gauge hangs from the moving carriage, so a probe travelling down into a specimen is
//! pushing and reads negative; pulling reads positive. [`Direction::from_force`] maps a reading
//! onto the direction the probe would have to be moving to produce it.

use crate::error::{AppResult, FdmError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Movement direction of the axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Away from the specimen (positive Z).
    Up,
    /// Toward the specimen (negative Z).
    Down,
    /// No motion; invalid for any distance-bearing operation.
    Still,
}

pub use Direction::{Down, Still, Up};

impl Direction {
    /// +1 for `Up`, -1 for `Down`, 0 for `Still`.
    pub fn sign(self) -> f64 {
        match self {
            Up => 1.0,
            Down => -1.0,
            Still => 0.0,
        }
    }

    /// The opposite direction; `Still` stays `Still`.
    pub fn flip(self) -> Self {
        match self {
            Up => Down,
            Down => Up,
            Still => Still,
        }
    }

    /// Classify a signed force reading. Zero maps to `Still`.
    pub fn from_force(force: f64) -> Self {
        if force < 0.0 {
            Down
        } else if force > 0.0 {
            Up
        } else {
            Still
        }
    }

    /// Give `magnitude` the sign of this direction.
    ///
    /// # Errors
    /// `FdmError::InvalidDirection` for `Still`.
    pub fn signed(self, magnitude: f64) -> AppResult<f64> {
        match self {
            Still => Err(FdmError::InvalidDirection),
            _ => Ok(magnitude.abs() * self.sign()),
        }
    }

    /// Direction of a signed distance.
    pub fn of_distance(distance: f64) -> Self {
        Self::from_force(distance)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Up => "UP",
            Down => "DOWN",
            Still => "STILL",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "UP" => Ok(Up),
            "DOWN" => Ok(Down),
            "STILL" => Ok(Still),
            other => Err(format!(
                "Invalid direction '{}'. Must be one of: UP, DOWN, STILL",
                other
            )),
        }
    }
}

// Force predicates used by threshold-seeking searches.

/// True when the force reads anything but zero.
pub fn is_nonzero(force: f64) -> bool {
    force != 0.0
}

/// Predicate: force is zero, or has crossed over to `direction`'s side.
pub fn zero_or_toward(direction: Direction) -> impl Fn(f64) -> bool + Send + Sync {
    move |force| force == 0.0 || Direction::from_force(force) == direction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_and_sign() {
        assert_eq!(Up.flip(), Down);
        assert_eq!(Down.flip(), Up);
        assert_eq!(Still.flip(), Still);
        assert_eq!(Up.sign() + Down.sign(), 0.0);
        assert_eq!(Still.sign(), 0.0);
    }

    #[test]
    fn classify_force() {
        assert_eq!(Direction::from_force(-0.012), Down);
        assert_eq!(Direction::from_force(0.5), Up);
        assert_eq!(Direction::from_force(0.0), Still);
        assert_eq!(Direction::from_force(-0.0), Still);
    }

    #[test]
    fn signed_rejects_still() {
        assert_eq!(Down.signed(0.25).unwrap(), -0.25);
        assert_eq!(Up.signed(-0.25).unwrap(), 0.25);
        assert!(matches!(Still.signed(1.0), Err(FdmError::InvalidDirection)));
    }

    #[test]
    fn parse_and_display_by_name() {
        assert_eq!("down".parse::<Direction>().unwrap(), Down);
        assert_eq!(" Up ".parse::<Direction>().unwrap(), Up);
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!(Down.to_string(), "DOWN");
        assert_eq!(serde_json::to_string(&Still).unwrap(), "\"STILL\"");
    }

    #[test]
    fn crossing_predicate() {
        let pred = zero_or_toward(Up);
        assert!(pred(0.0));
        assert!(pred(0.1));
        assert!(!pred(-0.1));
    }
}
