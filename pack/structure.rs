//! Structural description of a model: everything the variable layout depends
//! on, and nothing it does not.

use crate::config::{ConfigError, load_toml};
use crate::rates::Rate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Dimensions of one smoothing grid, with optional coordinates.
///
/// Coordinates are only needed to turn packed values back into functions of
/// age and time; the layout itself uses `n_age` and `n_time` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingGrid {
    #[serde(default)]
    pub name: String,
    pub n_age: usize,
    pub n_time: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Vec<f64>>,
}

impl SmoothingGrid {
    pub fn new(name: impl Into<String>, n_age: usize, n_time: usize) -> Self {
        Self {
            name: name.into(),
            n_age,
            n_time,
            age: None,
            time: None,
        }
    }

    pub fn with_coordinates(name: impl Into<String>, age: Vec<f64>, time: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            n_age: age.len(),
            n_time: time.len(),
            age: Some(age),
            time: Some(time),
        }
    }

    /// Number of grid points, and so the length of every block that uses this
    /// smoothing.
    pub fn n_var(&self) -> usize {
        self.n_age * self.n_time
    }

    pub fn coordinates(&self) -> Option<(&[f64], &[f64])> {
        match (&self.age, &self.time) {
            (Some(age), Some(time)) => Some((age.as_slice(), time.as_slice())),
            _ => None,
        }
    }
}

/// What a covariate multiplier scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MulcovKind {
    /// A rate's value.
    RateValue,
    /// The mean of an integrand's measurements.
    MeasValue,
    /// The noise of an integrand's measurements.
    MeasNoise,
}

impl MulcovKind {
    pub fn name(self) -> &'static str {
        match self {
            MulcovKind::RateValue => "rate_value",
            MulcovKind::MeasValue => "meas_value",
            MulcovKind::MeasNoise => "meas_noise",
        }
    }
}

impl fmt::Display for MulcovKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One covariate multiplier; declaration order is packing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mulcov_type", rename_all = "snake_case")]
pub enum MulcovSpec {
    RateValue {
        rate: Rate,
        covariate_id: usize,
        smooth_id: usize,
    },
    MeasValue {
        integrand_id: usize,
        covariate_id: usize,
        smooth_id: usize,
    },
    MeasNoise {
        integrand_id: usize,
        covariate_id: usize,
        smooth_id: usize,
    },
}

impl MulcovSpec {
    pub fn kind(&self) -> MulcovKind {
        match self {
            MulcovSpec::RateValue { .. } => MulcovKind::RateValue,
            MulcovSpec::MeasValue { .. } => MulcovKind::MeasValue,
            MulcovSpec::MeasNoise { .. } => MulcovKind::MeasNoise,
        }
    }

    pub fn covariate_id(&self) -> usize {
        match *self {
            MulcovSpec::RateValue { covariate_id, .. }
            | MulcovSpec::MeasValue { covariate_id, .. }
            | MulcovSpec::MeasNoise { covariate_id, .. } => covariate_id,
        }
    }

    pub fn smooth_id(&self) -> usize {
        match *self {
            MulcovSpec::RateValue { smooth_id, .. }
            | MulcovSpec::MeasValue { smooth_id, .. }
            | MulcovSpec::MeasNoise { smooth_id, .. } => smooth_id,
        }
    }

    /// The integrand a measurement multiplier is attached to.
    pub fn integrand_id(&self) -> Option<usize> {
        match *self {
            MulcovSpec::RateValue { .. } => None,
            MulcovSpec::MeasValue { integrand_id, .. } | MulcovSpec::MeasNoise { integrand_id, .. } => {
                Some(integrand_id)
            }
        }
    }

    /// The rate a rate multiplier is attached to.
    pub fn rate(&self) -> Option<Rate> {
        match *self {
            MulcovSpec::RateValue { rate, .. } => Some(rate),
            MulcovSpec::MeasValue { .. } | MulcovSpec::MeasNoise { .. } => None,
        }
    }
}

/// Parent and child smoothings of one rate. `None` means the rate (or its
/// random effects) is not estimated and its blocks are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSmoothing {
    pub rate: Rate,
    #[serde(default)]
    pub parent_smooth_id: Option<usize>,
    #[serde(default)]
    pub child_smooth_id: Option<usize>,
}

/// Input to [`VariablePacker::new`](super::VariablePacker::new).
///
/// ```toml
/// n_integrand = 2
/// n_child = 3
///
/// [[smoothing]]
/// name = "smooth_iota"
/// age = [0.0, 50.0, 100.0]
/// time = [1990.0, 2010.0]
/// n_age = 3
/// n_time = 2
///
/// [[rate]]
/// rate = "iota"
/// parent_smooth_id = 0
///
/// [[mulcov]]
/// mulcov_type = "meas_value"
/// integrand_id = 1
/// covariate_id = 0
/// smooth_id = 0
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStructure {
    pub n_integrand: usize,
    pub n_child: usize,
    #[serde(default)]
    pub smoothing: Vec<SmoothingGrid>,
    #[serde(default)]
    pub mulcov: Vec<MulcovSpec>,
    #[serde(default)]
    pub rate: Vec<RateSmoothing>,
}

impl ModelStructure {
    /// Loads a structure from a TOML file. Consistency is checked when the
    /// packer is built, not here.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let structure: ModelStructure = load_toml(path)?;
        log::debug!(
            "model structure: {} smoothings, {} mulcovs, {} rates, {} children",
            structure.smoothing.len(),
            structure.mulcov.len(),
            structure.rate.len(),
            structure.n_child
        );
        Ok(structure)
    }

    pub fn rate_smoothing(&self, rate: Rate) -> Option<&RateSmoothing> {
        self.rate.iter().find(|entry| entry.rate == rate)
    }
}
