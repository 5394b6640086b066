//! Unit-tagged scalar quantities.
//!
//! Addition and subtraction require identical units. Multiplication and
//! division only produce a unit listed in the derivation tables below;
//! there is no implicit coercion between units.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

use crate::error::{SimError, SimResult};

/// Physical dimension of a quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Unit {
    /// mmol/L
    Concentration,
    /// mg
    Mass,
    /// N
    Force,
    /// s
    Time,
    Dimensionless,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Concentration => "mmol/L",
            Unit::Mass => "mg",
            Unit::Force => "N",
            Unit::Time => "s",
            Unit::Dimensionless => "1",
        }
    }

    /// Concentrations and masses are conserved pools by default
    pub fn is_conserved(self) -> bool {
        matches!(self, Unit::Concentration | Unit::Mass)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

use self::Unit::{Concentration as C, Dimensionless as D, Force as F, Mass as M, Time as T};

/// Whitelisted derivations for `lhs * rhs`
const PRODUCTS: &[(Unit, Unit, Unit)] = &[
    (D, D, D),
    (C, D, C),
    (D, C, C),
    (M, D, M),
    (D, M, M),
    (F, D, F),
    (D, F, F),
    (T, D, T),
    (D, T, T),
];

/// Whitelisted derivations for `lhs / rhs`
const QUOTIENTS: &[(Unit, Unit, Unit)] = &[
    (D, D, D),
    (C, D, C),
    (C, C, D),
    (M, D, M),
    (M, M, D),
    (F, D, F),
    (F, F, D),
    (T, D, T),
    (T, T, D),
];

fn derive(table: &[(Unit, Unit, Unit)], lhs: Unit, rhs: Unit) -> Option<Unit> {
    table
        .iter()
        .find(|(a, b, _)| *a == lhs && *b == rhs)
        .map(|(_, _, out)| *out)
}

/// A magnitude paired with its unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn concentration(value: f64) -> Self {
        Self::new(value, Unit::Concentration)
    }

    pub fn mass(value: f64) -> Self {
        Self::new(value, Unit::Mass)
    }

    pub fn force(value: f64) -> Self {
        Self::new(value, Unit::Force)
    }

    pub fn time(value: f64) -> Self {
        Self::new(value, Unit::Time)
    }

    pub fn dimensionless(value: f64) -> Self {
        Self::new(value, Unit::Dimensionless)
    }

    pub fn checked_add(self, rhs: Self) -> SimResult<Self> {
        self.same_unit("addition", rhs)?;
        Ok(Self::new(self.value + rhs.value, self.unit))
    }

    pub fn checked_sub(self, rhs: Self) -> SimResult<Self> {
        self.same_unit("subtraction", rhs)?;
        Ok(Self::new(self.value - rhs.value, self.unit))
    }

    pub fn checked_mul(self, rhs: Self) -> SimResult<Self> {
        let unit = derive(PRODUCTS, self.unit, rhs.unit).ok_or(SimError::IncompatibleUnits {
            op: "multiplication",
            lhs: self.unit,
            rhs: rhs.unit,
        })?;
        Ok(Self::new(self.value * rhs.value, unit))
    }

    pub fn checked_div(self, rhs: Self) -> SimResult<Self> {
        let unit = derive(QUOTIENTS, self.unit, rhs.unit).ok_or(SimError::IncompatibleUnits {
            op: "division",
            lhs: self.unit,
            rhs: rhs.unit,
        })?;
        let value = self.value / rhs.value;
        if !value.is_finite() {
            return Err(SimError::Numeric(format!(
                "division {} / {} is not finite",
                self, rhs
            )));
        }
        Ok(Self::new(value, unit))
    }

    fn same_unit(self, op: &'static str, rhs: Self) -> SimResult<()> {
        if self.unit == rhs.unit {
            Ok(())
        } else {
            Err(SimError::IncompatibleUnits {
                op,
                lhs: self.unit,
                rhs: rhs.unit,
            })
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

impl Add for Quantity {
    type Output = SimResult<Quantity>;
    fn add(self, rhs: Self) -> Self::Output {
        self.checked_add(rhs)
    }
}

impl Sub for Quantity {
    type Output = SimResult<Quantity>;
    fn sub(self, rhs: Self) -> Self::Output {
        self.checked_sub(rhs)
    }
}

impl Mul for Quantity {
    type Output = SimResult<Quantity>;
    fn mul(self, rhs: Self) -> Self::Output {
        self.checked_mul(rhs)
    }
}

impl Div for Quantity {
    type Output = SimResult<Quantity>;
    fn div(self, rhs: Self) -> Self::Output {
        self.checked_div(rhs)
    }
}

/// Scaling by a bare number keeps the unit
impl Mul<f64> for Quantity {
    type Output = Quantity;
    fn mul(self, scalar: f64) -> Quantity {
        Quantity::new(self.value * scalar, self.unit)
    }
}
