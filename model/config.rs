use crate::forward::ForwardOptions;
use crate::integrand::{Integrand, IntegrandRequest};
use crate::rates::{Rate, RateSet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Reads and deserializes a TOML file.
pub(crate) fn load_toml<T, P>(path: P) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let toml_string = fs::read_to_string(path)?;
    Ok(toml::from_str(&toml_string)?)
}

fn default_abs_tol() -> f64 {
    1e-8
}

/// A forward run with constant rates, as read by the `forward` subcommand.
///
/// ```toml
/// abs_tol = 1e-8
///
/// [options]
/// method = "eigen"
///
/// [rates]
/// iota = 0.01
/// omega = 0.02
///
/// [[request]]
/// integrand = "prevalence"
/// age = 50.0
/// time = [2000.0, 2010.0]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "default_abs_tol")]
    pub abs_tol: f64,
    #[serde(default)]
    pub options: ForwardOptions,
    #[serde(default)]
    pub rates: ConstantRates,
    #[serde(default)]
    pub request: Vec<RequestConfig>,
}

impl ForwardConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ForwardConfig = load_toml(path)?;
        log::debug!(
            "forward config: {} requests, abs_tol {}, {:?}",
            config.request.len(),
            config.abs_tol,
            config.options.method
        );
        Ok(config)
    }

    pub fn requests(&self) -> Vec<IntegrandRequest> {
        self.request.iter().map(RequestConfig::to_request).collect()
    }
}

/// Constant values for the rates; an omitted rate is not modeled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantRates {
    pub pini: Option<f64>,
    pub iota: Option<f64>,
    pub rho: Option<f64>,
    pub chi: Option<f64>,
    pub omega: Option<f64>,
}

impl ConstantRates {
    pub fn get(&self, rate: Rate) -> Option<f64> {
        match rate {
            Rate::Pini => self.pini,
            Rate::Iota => self.iota,
            Rate::Rho => self.rho,
            Rate::Chi => self.chi,
            Rate::Omega => self.omega,
        }
    }

    pub fn to_rate_set(&self) -> RateSet {
        Rate::ALL
            .iter()
            .fold(RateSet::zero(), |rates, &rate| match self.get(rate) {
                Some(value) => rates.with_constant(rate, value),
                None => rates,
            })
    }
}

/// An age or time extent: a single value or a `[lower, upper]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Span {
    Point(f64),
    Range([f64; 2]),
}

impl Span {
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Span::Point(value) => (value, value),
            Span::Range([lower, upper]) => (lower, upper),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub integrand: Integrand,
    pub age: Span,
    pub time: Span,
}

impl RequestConfig {
    pub fn to_request(&self) -> IntegrandRequest {
        IntegrandRequest::rectangle(self.integrand, self.age.bounds(), self.time.bounds())
    }
}
