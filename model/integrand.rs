use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Measurable quantities derived from the rates.
///
/// The serialized names are the ones used in integrand tables and data files,
/// so they keep their mixed case (`Sincidence`, `withC`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Integrand {
    /// Incidence among susceptibles, `iota`.
    #[serde(rename = "Sincidence")]
    Sincidence,
    /// Legacy name for [`Integrand::Sincidence`].
    #[serde(rename = "incidence")]
    Incidence,
    #[serde(rename = "remission")]
    Remission,
    #[serde(rename = "mtexcess")]
    MtExcess,
    #[serde(rename = "mtother")]
    MtOther,
    #[serde(rename = "mtwith")]
    MtWith,
    #[serde(rename = "relrisk")]
    RelRisk,
    #[serde(rename = "susceptible")]
    Susceptible,
    #[serde(rename = "withC")]
    WithC,
    #[serde(rename = "prevalence")]
    Prevalence,
    /// Incidence relative to the total population, `iota * (1 - P)`.
    #[serde(rename = "Tincidence")]
    Tincidence,
    #[serde(rename = "mtspecific")]
    MtSpecific,
    #[serde(rename = "mtall")]
    MtAll,
    #[serde(rename = "mtstandard")]
    MtStandard,
}

impl Integrand {
    pub const ALL: [Integrand; 14] = [
        Integrand::Sincidence,
        Integrand::Incidence,
        Integrand::Remission,
        Integrand::MtExcess,
        Integrand::MtOther,
        Integrand::MtWith,
        Integrand::RelRisk,
        Integrand::Susceptible,
        Integrand::WithC,
        Integrand::Prevalence,
        Integrand::Tincidence,
        Integrand::MtSpecific,
        Integrand::MtAll,
        Integrand::MtStandard,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Integrand::Sincidence => "Sincidence",
            Integrand::Incidence => "incidence",
            Integrand::Remission => "remission",
            Integrand::MtExcess => "mtexcess",
            Integrand::MtOther => "mtother",
            Integrand::MtWith => "mtwith",
            Integrand::RelRisk => "relrisk",
            Integrand::Susceptible => "susceptible",
            Integrand::WithC => "withC",
            Integrand::Prevalence => "prevalence",
            Integrand::Tincidence => "Tincidence",
            Integrand::MtSpecific => "mtspecific",
            Integrand::MtAll => "mtall",
            Integrand::MtStandard => "mtstandard",
        }
    }

    /// Whether the value depends on the compartment state, and therefore on
    /// the whole cohort history rather than the rates at one point.
    pub fn needs_ode(self) -> bool {
        match self {
            Integrand::Sincidence
            | Integrand::Incidence
            | Integrand::Remission
            | Integrand::MtExcess
            | Integrand::MtOther
            | Integrand::MtWith
            | Integrand::RelRisk => false,
            Integrand::Susceptible
            | Integrand::WithC
            | Integrand::Prevalence
            | Integrand::Tincidence
            | Integrand::MtSpecific
            | Integrand::MtAll
            | Integrand::MtStandard => true,
        }
    }
}

impl fmt::Display for Integrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a valid integrand name")]
pub struct UnknownIntegrandName(pub String);

impl FromStr for Integrand {
    type Err = UnknownIntegrandName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Integrand::ALL
            .iter()
            .copied()
            .find(|integrand| integrand.name() == s)
            .ok_or_else(|| UnknownIntegrandName(s.to_string()))
    }
}

/// Why an age-time rectangle was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsProblem {
    NonFinite,
    NegativeAge,
    AgeReversed,
    TimeReversed,
    NotAPoint,
}

impl fmt::Display for BoundsProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BoundsProblem::NonFinite => "bounds must be finite",
            BoundsProblem::NegativeAge => "age must be non-negative",
            BoundsProblem::AgeReversed => "age_lower exceeds age_upper",
            BoundsProblem::TimeReversed => "time_lower exceeds time_upper",
            BoundsProblem::NotAPoint => "point evaluation needs equal lower and upper bounds",
        };
        f.write_str(text)
    }
}

/// One integrand over an age-time rectangle. A point request has equal lower
/// and upper bounds in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrandRequest {
    pub integrand: Integrand,
    pub age_lower: f64,
    pub age_upper: f64,
    pub time_lower: f64,
    pub time_upper: f64,
}

impl IntegrandRequest {
    pub fn point(integrand: Integrand, age: f64, time: f64) -> Self {
        Self {
            integrand,
            age_lower: age,
            age_upper: age,
            time_lower: time,
            time_upper: time,
        }
    }

    pub fn rectangle(integrand: Integrand, age: (f64, f64), time: (f64, f64)) -> Self {
        Self {
            integrand,
            age_lower: age.0,
            age_upper: age.1,
            time_lower: time.0,
            time_upper: time.1,
        }
    }

    pub fn is_point(&self) -> bool {
        self.age_lower == self.age_upper && self.time_lower == self.time_upper
    }

    /// Checks the rectangle itself; whether it must also be a point is up to
    /// the caller.
    pub fn check_bounds(&self) -> Result<(), BoundsProblem> {
        let bounds = [self.age_lower, self.age_upper, self.time_lower, self.time_upper];
        if bounds.iter().any(|b| !b.is_finite()) {
            return Err(BoundsProblem::NonFinite);
        }
        if self.age_lower < 0.0 {
            return Err(BoundsProblem::NegativeAge);
        }
        if self.age_lower > self.age_upper {
            return Err(BoundsProblem::AgeReversed);
        }
        if self.time_lower > self.time_upper {
            return Err(BoundsProblem::TimeReversed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back_to_the_same_variant() {
        for integrand in Integrand::ALL {
            assert_eq!(integrand.name().parse::<Integrand>().unwrap(), integrand);
        }
        assert_eq!(
            "Prevalence".parse::<Integrand>(),
            Err(UnknownIntegrandName("Prevalence".to_string()))
        );
    }

    #[test]
    fn direct_and_ode_integrands_are_split_as_documented() {
        let direct: Vec<_> = Integrand::ALL.iter().filter(|i| !i.needs_ode()).collect();
        assert_eq!(direct.len(), 7);
        assert!(!Integrand::RelRisk.needs_ode());
        assert!(Integrand::MtStandard.needs_ode());
        assert!(Integrand::Tincidence.needs_ode());
    }

    #[test]
    fn bounds_are_checked_in_order() {
        let mut request = IntegrandRequest::point(Integrand::Prevalence, 10.0, 2000.0);
        assert!(request.is_point());
        assert_eq!(request.check_bounds(), Ok(()));

        request.age_lower = -1.0;
        assert_eq!(request.check_bounds(), Err(BoundsProblem::NegativeAge));

        request.age_lower = 20.0;
        assert_eq!(request.check_bounds(), Err(BoundsProblem::AgeReversed));

        request.age_lower = 0.0;
        request.time_lower = 2001.0;
        assert_eq!(request.check_bounds(), Err(BoundsProblem::TimeReversed));

        request.time_upper = f64::NAN;
        assert_eq!(request.check_bounds(), Err(BoundsProblem::NonFinite));
    }

    #[test]
    fn serde_uses_table_spelling() {
        #[derive(Deserialize)]
        struct Row {
            integrand: Integrand,
        }
        let row: Row = toml::from_str("integrand = \"withC\"").unwrap();
        assert_eq!(row.integrand, Integrand::WithC);
    }
}
