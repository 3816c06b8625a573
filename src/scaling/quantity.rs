use std::fmt;
use std::num::ParseFloatError;
use std::sync::OnceLock;

use regex::Regex;

use crate::resources::inferenceservices::MetricQuantity;

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QuantitySuffix {
    None,
    Ki,
    Mi,
    Gi,
    Ti,
    Pi,
    Ei,
    m,
    k,
    M,
    G,
    T,
    P,
    E,
}

impl QuantitySuffix {
    fn new(unit: &str) -> Option<Self> {
        Some(match unit {
            "" => Self::None,
            "Ki" => Self::Ki,
            "Mi" => Self::Mi,
            "Gi" => Self::Gi,
            "Ti" => Self::Ti,
            "Pi" => Self::Pi,
            "Ei" => Self::Ei,
            "m" => Self::m,
            "k" => Self::k,
            "M" => Self::M,
            "G" => Self::G,
            "T" => Self::T,
            "P" => Self::P,
            "E" => Self::E,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Ki => "Ki",
            Self::Mi => "Mi",
            Self::Gi => "Gi",
            Self::Ti => "Ti",
            Self::Pi => "Pi",
            Self::Ei => "Ei",
            Self::m => "m",
            Self::k => "k",
            Self::M => "M",
            Self::G => "G",
            Self::T => "T",
            Self::P => "P",
            Self::E => "E",
        }
    }

    fn multiplier(&self) -> f64 {
        match self {
            Self::None => 1.0,
            Self::Ki => 1024f64,
            Self::Mi => 1024f64.powi(2),
            Self::Gi => 1024f64.powi(3),
            Self::Ti => 1024f64.powi(4),
            Self::Pi => 1024f64.powi(5),
            Self::Ei => 1024f64.powi(6),
            Self::m => 1e-3,
            Self::k => 1e3,
            Self::M => 1e6,
            Self::G => 1e9,
            Self::T => 1e12,
            Self::P => 1e15,
            Self::E => 1e18,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    ParseFloatError(#[from] ParseFloatError),
    #[error("'{0}' is not a quantity")]
    InvalidFormat(String),
    #[error("'{0}' has an unknown unit suffix")]
    InvalidSuffix(String),
    #[error("{0} is not a finite number")]
    NotFinite(f64),
}

/// A scaling target: a decimal number with an optional Kubernetes quantity suffix.
///
/// Whole numbers render without fractional digits (`50`, not `50.0`), which is the form
/// the HPA, KEDA and Knative schemas all accept.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetValue {
    number: f64,
    suffix: QuantitySuffix,
}

impl TargetValue {
    pub fn from_int(value: i64) -> Self {
        TargetValue {
            number: value as f64,
            suffix: QuantitySuffix::None,
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseError> {
        static REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = REGEX.get_or_init(|| {
            Regex::new(r"^([+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+))([[:alpha:]]{0,2})$").unwrap()
        });

        let value = value.trim();
        let Some(cap) = regex.captures(value) else {
            return Err(ParseError::InvalidFormat(value.into()));
        };

        let number = cap[1].parse::<f64>()?;
        let suffix =
            QuantitySuffix::new(&cap[2]).ok_or_else(|| ParseError::InvalidSuffix(value.into()))?;

        Ok(TargetValue { number, suffix })
    }

    /// The value with any suffix applied, for range checks
    pub fn magnitude(&self) -> f64 {
        self.number * self.suffix.multiplier()
    }

    pub fn is_positive(&self) -> bool {
        self.magnitude() > 0.0
    }

    /// The value as an integer, if it is whole and carries no suffix
    pub fn as_whole(&self) -> Option<i64> {
        (self.suffix == QuantitySuffix::None
            && self.number.fract() == 0.0
            && self.number.abs() < i64::MAX as f64)
            .then_some(self.number as i64)
    }
}

impl TryFrom<&MetricQuantity> for TargetValue {
    type Error = ParseError;

    fn try_from(quantity: &MetricQuantity) -> Result<Self, Self::Error> {
        match quantity {
            MetricQuantity::Int(i) => Ok(TargetValue::from_int(*i)),
            MetricQuantity::Float(f) if f.is_finite() => Ok(TargetValue {
                number: *f,
                suffix: QuantitySuffix::None,
            }),
            MetricQuantity::Float(f) => Err(ParseError::NotFinite(*f)),
            MetricQuantity::String(s) => TargetValue::parse(s),
        }
    }
}

impl fmt::Display for TargetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.number.fract() == 0.0 && self.number.abs() < 1e15 {
            write!(f, "{}", self.number as i64)?;
        } else {
            write!(f, "{}", self.number)?;
        }
        f.write_str(self.suffix.as_str())
    }
}
