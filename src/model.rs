//! Collaborator contracts and the domain value enumerations.
//!
//! The solver never inspects regression internals; it consumes exactly three
//! response shapes (binary probability, Gaussian score with RMSE, multinomial
//! value-probability mapping) through [`TransitionModel`], and converts gross
//! income to disposable income through [`TaxBenefitCalculator`]. Each domain
//! enumeration carries its own grid encoding through [`GridCoded`] instead of
//! being looked up through runtime introspection.

use crate::scale::CHILD_BANDS;

/// A domain enumeration with a fixed numeric grid encoding.
pub trait GridCoded: Sized + Copy {
    const COUNT: usize;

    fn code(self) -> f64;
    fn from_code(code: f64) -> Option<Self>;
}

macro_rules! grid_coded {
    ($name:ident { $($variant:ident),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl GridCoded for $name {
            const COUNT: usize = Self::ALL.len();

            fn code(self) -> f64 {
                Self::ALL.iter().position(|v| *v == self).unwrap_or(0) as f64
            }

            fn from_code(code: f64) -> Option<Self> {
                let idx = code.round();
                if !idx.is_finite() || idx < 0.0 || idx >= Self::COUNT as f64 {
                    return None;
                }
                Some(Self::ALL[idx as usize])
            }
        }
    };
}

grid_coded!(Gender { Female, Male });
grid_coded!(Education { Low, Medium, High });
grid_coded!(Health { Poor, Fair, Good });
grid_coded!(CareReceipt { None, Informal, Formal, Mixed });
grid_coded!(CareProvision {
    None,
    ToPartner,
    ToOther,
    ToPartnerAndOther,
});
grid_coded!(Region {
    NorthEast,
    NorthWest,
    Yorkshire,
    EastMidlands,
    WestMidlands,
    EastOfEngland,
    London,
    SouthEast,
    SouthWest,
    Wales,
    Scotland,
    NorthernIreland,
});

/// Named regressions the transition layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Regression {
    /// Binary: probability of holding a wage offer next period (principal).
    WageOffer1,
    /// Binary: probability of a wage offer for the secondary earner.
    WageOffer2,
    /// Binary: probability of dying before next period.
    Mortality,
    /// Binary: probability of being disabled next period.
    Disability,
    /// Binary: probability a single adult forms a cohabiting union.
    CohabitationFormation,
    /// Binary: probability a cohabiting union dissolves.
    CohabitationDissolution,
    /// Binary: probability of a birth at the proxy's age and existing count.
    Fertility,
    /// Binary: probability a student remains in education next period.
    StudentContinuation,
    /// Multinomial over [`Health`] codes.
    HealthTransition,
    /// Multinomial over [`CareReceipt`] codes.
    CareReceiptTransition,
    /// Multinomial over [`CareProvision`] codes.
    CareProvisionTransition,
    /// Multinomial over [`Education`] codes, scored when studies end.
    EducationOutcome,
    /// Multinomial over [`Region`] codes.
    RegionMobility,
    /// Gaussian: log hourly wage potential score and RMSE.
    WagePotential,
}

/// Gaussian regression response: a linear score and its residual RMSE.
#[derive(Debug, Clone, Copy)]
pub struct GaussianScore {
    pub mean: f64,
    pub rmse: f64,
}

/// Cheaply cloneable regression input describing the anticipated next-period
/// person. Branch-specific re-evaluation clones and overwrites the fields the
/// expanded axes changed; no shared mutable proxy object exists.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionInput {
    pub age_years: u32,
    pub birth_year: i32,
    pub gender: Gender,
    pub education: Education,
    pub student: bool,
    pub health: Health,
    pub disabled: bool,
    pub cohabiting: bool,
    pub retired: bool,
    pub children: [usize; CHILD_BANDS],
    pub region: Region,
    pub care_receipt: CareReceipt,
    pub care_provision: CareProvision,
    /// Existing birth count used by the fertility fold.
    pub births: usize,
    pub wage_potential_per_hour: f64,
}

impl RegressionInput {
    pub fn total_children(&self) -> usize {
        self.children.iter().sum()
    }
}

/// Conditional transition distributions supplied by the regression layer.
///
/// Implementations are consulted once per (branch, axis) during expectation
/// expansion and must be pure functions of their inputs.
pub trait TransitionModel: Sync {
    /// Binary outcome: a single probability in `[0, 1]`.
    fn probability(&self, input: &RegressionInput, regression: Regression) -> f64;

    /// Gaussian outcome: linear score plus RMSE, expanded through quadrature.
    fn gaussian_score(&self, input: &RegressionInput, regression: Regression) -> GaussianScore;

    /// Multinomial outcome: value-probability pairs over the outcome codes.
    fn distribution(&self, input: &RegressionInput, regression: Regression) -> Vec<(f64, f64)>;
}

/// One gross-to-disposable income conversion request.
#[derive(Debug, Clone)]
pub struct TaxQuery {
    pub year: i32,
    pub age_next: u32,
    pub adults: usize,
    pub children: [usize; CHILD_BANDS],
    pub hours_per_week_1: f64,
    pub hours_per_week_2: f64,
    pub disabled_1: bool,
    pub gross_income_per_month: f64,
    pub second_income_per_month: f64,
    pub childcare_cost_per_month: f64,
    pub social_care_cost_per_month: f64,
    pub liquid_wealth: f64,
}

/// The tax-and-benefit collaborator: disposable income per month for a
/// household description. The solver multiplies by 12 for annual accounting.
pub trait TaxBenefitCalculator: Sync {
    fn disposable_income_per_month(&self, query: &TaxQuery) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_for_every_variant() {
        for &e in Education::ALL {
            assert_eq!(Education::from_code(e.code()), Some(e));
        }
        for &r in Region::ALL {
            assert_eq!(Region::from_code(r.code()), Some(r));
        }
        for &c in CareProvision::ALL {
            assert_eq!(CareProvision::from_code(c.code()), Some(c));
        }
    }

    #[test]
    fn out_of_range_codes_decode_to_none() {
        assert_eq!(Gender::from_code(-1.0), None);
        assert_eq!(Gender::from_code(2.0), None);
        assert_eq!(Health::from_code(f64::NAN), None);
    }

    #[test]
    fn counts_match_variant_lists() {
        assert_eq!(Gender::COUNT, 2);
        assert_eq!(Education::COUNT, 3);
        assert_eq!(CareReceipt::COUNT, 4);
        assert_eq!(Region::COUNT, 12);
    }
}
