/// Utility-asymmetry gate: the target log-return must dominate the stop
/// log-return under the configured exponents, pi^alpha >= lambda * |ell|^beta.
use crate::types::Direction;

pub const UTILITY_ASYMMETRY_FAIL: &str = "UTILITY_ASYMMETRY_FAIL";

#[derive(Debug, Clone)]
pub struct UtilityGate {
    alpha: f64,
    beta: f64,
    lambda: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct GateOutcome {
    pub passed: bool,
    /// Target log-return, positive
    pub pi: f64,
    /// Stop log-return, negative
    pub ell: f64,
}

impl UtilityGate {
    pub fn new(alpha: f64, beta: f64, lambda: f64) -> Self {
        UtilityGate { alpha, beta, lambda }
    }

    /// Evaluate for an entry at `entry` with protective `stop` and `target`.
    /// Long: stop < entry < target. Short: mirrored.
    pub fn evaluate(&self, direction: Direction, entry: f64, stop: f64, target: f64) -> GateOutcome {
        if entry <= 0.0 || stop <= 0.0 || target <= 0.0 {
            return GateOutcome { passed: false, pi: 0.0, ell: 0.0 };
        }
        let (pi, ell) = match direction {
            Direction::Buy => ((target / entry).ln(), (stop / entry).ln()),
            Direction::Sell => ((entry / target).ln(), (entry / stop).ln()),
        };
        if pi <= 0.0 || ell >= 0.0 {
            // Malformed geometry: target not profitable or stop not protective
            return GateOutcome { passed: false, pi, ell };
        }
        let passed = pi.powf(self.alpha) >= self.lambda * ell.abs().powf(self.beta);
        GateOutcome { passed, pi, ell }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> UtilityGate {
        UtilityGate::new(0.6, 1.4, 3.0)
    }

    #[test]
    fn test_typical_zone_passes() {
        // entry 2450, stop 2400, target 2500
        let out = gate().evaluate(Direction::Buy, 2450.0, 2400.0, 2500.0);
        assert!(out.passed);
        assert!(out.pi > 0.0);
        assert!(out.ell < 0.0);
    }

    #[test]
    fn test_wide_stop_fails() {
        // Stop twice as far as the target
        let out = gate().evaluate(Direction::Buy, 100.0, 50.0, 103.0);
        assert!(!out.passed);
    }

    #[test]
    fn test_short_is_mirrored() {
        let long = gate().evaluate(Direction::Buy, 100.0, 98.0, 104.0);
        let short = gate().evaluate(Direction::Sell, 100.0, 102.0408, 96.1538);
        // ln mirror: 100/96.1538 ~ 104/100, 100/102.0408 ~ 98/100
        assert_eq!(long.passed, short.passed);
        assert!((long.pi - short.pi).abs() < 1e-3);
        assert!((long.ell - short.ell).abs() < 1e-3);
    }

    #[test]
    fn test_inverted_geometry_rejected() {
        // Target below entry on a long
        let out = gate().evaluate(Direction::Buy, 100.0, 95.0, 99.0);
        assert!(!out.passed);
    }
}
