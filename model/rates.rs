use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// The five fundamental rates, in the canonical order used for packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rate {
    /// Initial prevalence; a function of time only, evaluated at age zero.
    Pini,
    /// Incidence among susceptibles.
    Iota,
    /// Remission.
    Rho,
    /// Excess mortality among cases.
    Chi,
    /// Other-cause mortality.
    Omega,
}

impl Rate {
    pub const COUNT: usize = 5;
    pub const ALL: [Rate; Rate::COUNT] = [Rate::Pini, Rate::Iota, Rate::Rho, Rate::Chi, Rate::Omega];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Rate::Pini => "pini",
            Rate::Iota => "iota",
            Rate::Rho => "rho",
            Rate::Chi => "chi",
            Rate::Omega => "omega",
        }
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a rate name; expected one of pini, iota, rho, chi, omega")]
pub struct UnknownRateName(pub String);

impl FromStr for Rate {
    type Err = UnknownRateName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rate::ALL
            .iter()
            .copied()
            .find(|rate| rate.name() == s)
            .ok_or_else(|| UnknownRateName(s.to_string()))
    }
}

/// A total function of (age, time) that supplies one rate.
///
/// Implementations must be pure: the forward model calls them many times per
/// evaluation and from several threads at once.
pub trait RateFunction: Send + Sync {
    fn value(&self, age: f64, time: f64) -> f64;
}

impl<F> RateFunction for F
where
    F: Fn(f64, f64) -> f64 + Send + Sync,
{
    #[inline]
    fn value(&self, age: f64, time: f64) -> f64 {
        self(age, time)
    }
}

/// One slot of a [`RateSet`]. A rate that is not part of the model is an
/// explicit state rather than a missing entry.
#[derive(Clone, Default)]
pub enum RateSlot {
    #[default]
    NotModeled,
    Function(Arc<dyn RateFunction>),
}

impl fmt::Debug for RateSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSlot::NotModeled => f.write_str("NotModeled"),
            RateSlot::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Named lookup of the rate functions for one forward-model evaluation.
///
/// A set is built from the current decoded parameter vector, read during the
/// evaluation, and dropped afterwards. Cloning only bumps reference counts.
#[derive(Clone, Debug, Default)]
pub struct RateSet {
    slots: [RateSlot; Rate::COUNT],
}

impl RateSet {
    /// Every rate absent, i.e. identically zero.
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn from_slots(slots: [RateSlot; Rate::COUNT]) -> Self {
        Self { slots }
    }

    pub fn with<F>(mut self, rate: Rate, function: F) -> Self
    where
        F: RateFunction + 'static,
    {
        self.slots[rate.index()] = RateSlot::Function(Arc::new(function));
        self
    }

    pub fn with_constant(self, rate: Rate, value: f64) -> Self {
        self.with(rate, move |_: f64, _: f64| value)
    }

    pub fn set(&mut self, rate: Rate, slot: RateSlot) {
        self.slots[rate.index()] = slot;
    }

    pub fn is_modeled(&self, rate: Rate) -> bool {
        matches!(self.slots[rate.index()], RateSlot::Function(_))
    }

    /// Value of `rate` at `(age, time)`; `0.0` when the rate is not modeled.
    /// The function result is returned as is, negative or non-finite values
    /// included.
    #[inline]
    pub fn value(&self, rate: Rate, age: f64, time: f64) -> f64 {
        match &self.slots[rate.index()] {
            RateSlot::NotModeled => 0.0,
            RateSlot::Function(function) => function.value(age, time),
        }
    }

    /// `pini` is a function of time only; it is always evaluated at age zero.
    #[inline]
    pub fn initial_prevalence(&self, time: f64) -> f64 {
        self.value(Rate::Pini, 0.0, time)
    }

    /// The four rates that drive the compartment model, at one point.
    #[inline]
    pub fn point(&self, age: f64, time: f64) -> RatePoint {
        RatePoint {
            iota: self.value(Rate::Iota, age, time),
            rho: self.value(Rate::Rho, age, time),
            chi: self.value(Rate::Chi, age, time),
            omega: self.value(Rate::Omega, age, time),
        }
    }
}

/// Incidence, remission, excess and other-cause mortality at one (age, time).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePoint {
    pub iota: f64,
    pub rho: f64,
    pub chi: f64,
    pub omega: f64,
}

impl RatePoint {
    pub fn max_abs(&self) -> f64 {
        self.iota
            .abs()
            .max(self.rho.abs())
            .max(self.chi.abs())
            .max(self.omega.abs())
    }
}
