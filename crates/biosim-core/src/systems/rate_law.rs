//! Kinetic rate laws.
//!
//! Each process selects one tagged variant. Evaluation is pure: the rate
//! depends only on the substrate level read from the tick snapshot and the
//! law's fixed parameters.
//!
//! References:
//! - Michaelis L, Menten ML. Biochemische Zeitschrift. 1913;49:333-369
//! - Hill AV. Journal of Physiology. 1910;40:iv-vii

use serde::{Deserialize, Serialize};

use super::QuantityRef;

/// Rate law of a process, in target-quantity units per second
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RateLaw {
    /// v = k
    ZeroOrder { k: f64 },
    /// v = k * [S]
    FirstOrder { k: f64, substrate: QuantityRef },
    /// v = Vmax * [S] / (Km + [S])
    MichaelisMenten {
        vmax: f64,
        km: f64,
        substrate: QuantityRef,
    },
    /// v = Vmax * [S]^n / (K0.5^n + [S]^n)
    Hill {
        vmax: f64,
        k_half: f64,
        n: f64,
        substrate: QuantityRef,
    },
}

impl RateLaw {
    pub fn name(&self) -> &'static str {
        match self {
            RateLaw::ZeroOrder { .. } => "zeroOrder",
            RateLaw::FirstOrder { .. } => "firstOrder",
            RateLaw::MichaelisMenten { .. } => "michaelisMenten",
            RateLaw::Hill { .. } => "hill",
        }
    }

    /// Quantity the rate depends on, if any
    pub fn substrate(&self) -> Option<&QuantityRef> {
        match self {
            RateLaw::ZeroOrder { .. } => None,
            RateLaw::FirstOrder { substrate, .. }
            | RateLaw::MichaelisMenten { substrate, .. }
            | RateLaw::Hill { substrate, .. } => Some(substrate),
        }
    }

    /// Instantaneous rate at substrate level `s` (ignored for zero order).
    /// May be non-finite; callers decide what to do with that.
    pub fn rate(&self, s: f64) -> f64 {
        match *self {
            RateLaw::ZeroOrder { k } => k,
            RateLaw::FirstOrder { k, .. } => first_order(k, s),
            RateLaw::MichaelisMenten { vmax, km, .. } => michaelis_menten(vmax, km, s),
            RateLaw::Hill { vmax, k_half, n, .. } => hill_kinetics(vmax, k_half, s, n),
        }
    }

    /// Parameter sanity checks applied at load time
    pub fn validate(&self) -> Result<(), String> {
        let finite = |name: &str, v: f64| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(format!("{} must be finite (got {})", name, v))
            }
        };
        match *self {
            RateLaw::ZeroOrder { k } | RateLaw::FirstOrder { k, .. } => finite("k", k),
            RateLaw::MichaelisMenten { vmax, km, .. } => {
                finite("vmax", vmax)?;
                if !(km > 0.0 && km.is_finite()) {
                    return Err(format!("km must be positive (got {})", km));
                }
                Ok(())
            }
            RateLaw::Hill { vmax, k_half, n, .. } => {
                finite("vmax", vmax)?;
                if !(k_half > 0.0 && k_half.is_finite()) {
                    return Err(format!("k_half must be positive (got {})", k_half));
                }
                if !(n > 0.0 && n.is_finite()) {
                    return Err(format!("hill coefficient must be positive (got {})", n));
                }
                Ok(())
            }
        }
    }
}

#[inline]
pub fn first_order(k: f64, s: f64) -> f64 {
    if s <= 0.0 {
        return 0.0;
    }
    k * s
}

#[inline]
pub fn michaelis_menten(vmax: f64, km: f64, s: f64) -> f64 {
    if s <= 0.0 {
        return 0.0;
    }
    vmax * s / (km + s)
}

/// n > 1 gives positive cooperativity
#[inline]
pub fn hill_kinetics(vmax: f64, k_half: f64, s: f64, n: f64) -> f64 {
    if s <= 0.0 {
        return 0.0;
    }
    let s_n = s.powf(n);
    let k_n = k_half.powf(n);
    vmax * s_n / (k_n + s_n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn substrate() -> QuantityRef {
        QuantityRef::subject("lysine")
    }

    #[test]
    fn test_michaelis_menten_half_max_at_km() {
        let v = michaelis_menten(2.0, 0.5, 0.5);
        assert!((v - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_michaelis_menten_saturates() {
        let law = RateLaw::MichaelisMenten {
            vmax: 3.0,
            km: 0.05,
            substrate: substrate(),
        };
        // [S] = 10^4 Km
        let v = law.rate(500.0);
        assert!((3.0 - v) / 3.0 < 1e-3);
        assert!(v < 3.0);
    }

    #[test]
    fn test_hill_is_sigmoidal() {
        let low = hill_kinetics(1.0, 1.0, 0.5, 4.0);
        let mid = hill_kinetics(1.0, 1.0, 1.0, 4.0);
        let high = hill_kinetics(1.0, 1.0, 2.0, 4.0);
        assert!(low < 0.1);
        assert!((mid - 0.5).abs() < 1e-12);
        assert!(high > 0.9);
    }

    #[test]
    fn test_empty_substrate_gives_zero_rate() {
        assert_eq!(first_order(0.3, 0.0), 0.0);
        assert_eq!(michaelis_menten(1.0, 1.0, -1.0), 0.0);
        let zero = RateLaw::ZeroOrder { k: 0.05 };
        assert_eq!(zero.rate(0.0), 0.05);
        assert!(zero.substrate().is_none());
    }

    #[test]
    fn test_overflowing_hill_is_not_finite() {
        let law = RateLaw::Hill {
            vmax: 1.0,
            k_half: 1e200,
            n: 4.0,
            substrate: substrate(),
        };
        assert!(!law.rate(1e200).is_finite());
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let bad_km = RateLaw::MichaelisMenten {
            vmax: 1.0,
            km: 0.0,
            substrate: substrate(),
        };
        assert!(bad_km.validate().is_err());

        let bad_n = RateLaw::Hill {
            vmax: 1.0,
            k_half: 1.0,
            n: -2.0,
            substrate: substrate(),
        };
        assert!(bad_n.validate().is_err());

        assert!(RateLaw::ZeroOrder { k: f64::NAN }.validate().is_err());
        assert!(RateLaw::FirstOrder { k: 0.1, substrate: substrate() }.validate().is_ok());
    }
}
