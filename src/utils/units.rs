use crate::fitting::common::error::FitError;
use crate::utils::constants::MW_TO_W;
use std::fmt;
use std::str::FromStr;

/// Unit of a microwave power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerUnit {
    Dbm,
    Watt,
}

impl FromStr for PowerUnit {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dbm" => Ok(PowerUnit::Dbm),
            "watt" | "w" => Ok(PowerUnit::Watt),
            other => Err(FitError::InvalidInput(format!("unknown power unit '{other}'"))),
        }
    }
}

impl fmt::Display for PowerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerUnit::Dbm => write!(f, "dBm"),
            PowerUnit::Watt => write!(f, "W"),
        }
    }
}

pub fn dbm_to_watt(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0) * MW_TO_W
}

pub fn watt_to_dbm(watt: f64) -> f64 {
    10.0 * (watt / MW_TO_W).log10()
}

/// Converts a power in `unit` to watts.
pub fn to_watt(power: f64, unit: PowerUnit) -> f64 {
    match unit {
        PowerUnit::Dbm => dbm_to_watt(power),
        PowerUnit::Watt => power,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn zero_dbm_is_one_milliwatt() {
        assert_relative_eq!(dbm_to_watt(0.0), 1e-3);
        assert_relative_eq!(dbm_to_watt(-30.0), 1e-6, max_relative = 1e-12);
        assert_relative_eq!(watt_to_dbm(dbm_to_watt(-97.3)), -97.3, epsilon = 1e-10);
    }

    #[test]
    fn parses_units() {
        assert_eq!("dBm".parse::<PowerUnit>(), Ok(PowerUnit::Dbm));
        assert_eq!("watt".parse::<PowerUnit>(), Ok(PowerUnit::Watt));
        assert!("volt".parse::<PowerUnit>().is_err());
    }
}
