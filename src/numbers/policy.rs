//! Plan-based number retention policy.

use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;

/// How a plan's numbers are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionMode {
    /// Inactive numbers are reclaimed after a cooling-off hold.
    AutoRecycle,
    /// Numbers are locked to the owner and never reclaimed.
    Protected,
}

/// Retention policy for one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberPolicy {
    /// Retention mode.
    pub mode: RetentionMode,
    /// Days without traffic before recycling (0 under `PROTECTED`).
    pub inactivity_days: u32,
    /// Cooling-off days on release (0 means straight back to the pool).
    pub hold_days: u32,
}

impl NumberPolicy {
    /// Whether numbers on this policy may be reclaimed.
    pub fn recycles(&self) -> bool {
        self.mode == RetentionMode::AutoRecycle
    }
}

/// Resolve the retention policy for a plan name.
///
/// Plan names are matched case-insensitively against
/// [`PoolConfig::premium_plans`]; everything else is treated as free.
pub fn policy(plan: &str, config: &PoolConfig) -> NumberPolicy {
    let plan = plan.trim();
    let premium = config
        .premium_plans
        .iter()
        .any(|p| p.eq_ignore_ascii_case(plan));
    if premium {
        NumberPolicy {
            mode: RetentionMode::Protected,
            inactivity_days: 0,
            hold_days: 0,
        }
    } else {
        NumberPolicy {
            mode: RetentionMode::AutoRecycle,
            inactivity_days: config.free_inactivity_days,
            hold_days: config.free_hold_days,
        }
    }
}
