// =============================================================================
// Shared enums used across the Aurora market simulation engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Lifecycle state of a runtime object tracked by the registry.
///
/// Transitions: `Ready -> Active` (automatic, on first tick), `Active <->
/// Paused` (by command), any non-terminal `-> Destroying` (by command or
/// error threshold), `Destroying -> Destroyed` (after cleanup runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Ready,
    Active,
    Paused,
    Destroying,
    Destroyed,
}

impl LifecycleState {
    /// All non-terminal states a registry iteration might be asked for.
    pub const ALL: [LifecycleState; 5] = [
        LifecycleState::Ready,
        LifecycleState::Active,
        LifecycleState::Paused,
        LifecycleState::Destroying,
        LifecycleState::Destroyed,
    ];

    /// Whether `to` is a legal transition target from `self`.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Ready, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Ready, Destroying)
                | (Active, Destroying)
                | (Paused, Destroying)
                | (Destroying, Destroyed)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Active => write!(f, "Active"),
            Self::Paused => write!(f, "Paused"),
            Self::Destroying => write!(f, "Destroying"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// Closed set of stock categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCategory {
    Technology,
    Finance,
    Energy,
    Healthcare,
    Consumer,
    Industrial,
    Utilities,
    RealEstate,
}

impl std::fmt::Display for StockCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Technology => "Technology",
            Self::Finance => "Finance",
            Self::Energy => "Energy",
            Self::Healthcare => "Healthcare",
            Self::Consumer => "Consumer",
            Self::Industrial => "Industrial",
            Self::Utilities => "Utilities",
            Self::RealEstate => "RealEstate",
        };
        write!(f, "{s}")
    }
}

/// A trader's risk tolerance — drives both position sizing and the
/// allocation algorithms in `factory::allocation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskProfile {
    /// Weighting exponent used by the `weighted_random` allocation
    /// algorithm: aggressive traders draw a sharper `uniform(0,1)^(1/w)`.
    pub fn allocation_weight(self) -> f64 {
        match self {
            Self::Conservative => 1.0,
            Self::Moderate => 2.0,
            Self::Aggressive => 3.0,
        }
    }
}

impl std::fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Conservative => "Conservative",
            Self::Moderate => "Moderate",
            Self::Aggressive => "Aggressive",
        };
        write!(f, "{s}")
    }
}

/// A trader's holding-period preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingStyle {
    Day,
    Swing,
    Position,
}

impl std::fmt::Display for TradingStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Day => "Day",
            Self::Swing => "Swing",
            Self::Position => "Position",
        };
        write!(f, "{s}")
    }
}

/// Status of a market instance as tracked by the Instance Controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Creating,
    Active,
    Stopped,
    Error,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Active => "Active",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_legal_transitions() {
        assert!(LifecycleState::Ready.can_transition_to(LifecycleState::Active));
        assert!(LifecycleState::Active.can_transition_to(LifecycleState::Paused));
        assert!(LifecycleState::Paused.can_transition_to(LifecycleState::Active));
        assert!(LifecycleState::Destroying.can_transition_to(LifecycleState::Destroyed));
    }

    #[test]
    fn lifecycle_illegal_transitions() {
        assert!(!LifecycleState::Ready.can_transition_to(LifecycleState::Paused));
        assert!(!LifecycleState::Destroyed.can_transition_to(LifecycleState::Active));
        assert!(!LifecycleState::Active.can_transition_to(LifecycleState::Ready));
    }

    #[test]
    fn allocation_weights_increase_with_risk() {
        assert!(RiskProfile::Aggressive.allocation_weight() > RiskProfile::Moderate.allocation_weight());
        assert!(RiskProfile::Moderate.allocation_weight() > RiskProfile::Conservative.allocation_weight());
    }
}
