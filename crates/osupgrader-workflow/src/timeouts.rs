//! Timeout budgets and guest settle delays

use serde::{Deserialize, Serialize};
use std::time::Duration;

const fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

/// Default overall budget per machine
pub const DEFAULT_OVERALL_TIMEOUT: Duration = minutes(150);
/// Default wait for the signal-setup script
pub const DEFAULT_SETUP_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait for the post-reboot readiness marker
pub const DEFAULT_SIGNAL_FILE_TIMEOUT: Duration = minutes(30);
/// Default wait for the guest to report the target OS
pub const DEFAULT_TARGET_OS_TIMEOUT: Duration = minutes(20);
/// Default wait for a guest-initiated power-off
pub const DEFAULT_POWER_OFF_TIMEOUT: Duration = minutes(5);

/// Named timeouts for one machine's upgrade
///
/// A zero duration means "use the default"; call [`TimeoutConfig::resolved`]
/// to get a config with every field filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub overall: Duration,
    pub setup_script: Duration,
    pub signal_file: Duration,
    pub target_os: Duration,
    pub power_off: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            overall: DEFAULT_OVERALL_TIMEOUT,
            setup_script: DEFAULT_SETUP_SCRIPT_TIMEOUT,
            signal_file: DEFAULT_SIGNAL_FILE_TIMEOUT,
            target_os: DEFAULT_TARGET_OS_TIMEOUT,
            power_off: DEFAULT_POWER_OFF_TIMEOUT,
        }
    }
}

impl TimeoutConfig {
    /// Replace zero values with their defaults
    pub fn resolved(self) -> Self {
        fn or(value: Duration, default: Duration) -> Duration {
            if value.is_zero() {
                default
            } else {
                value
            }
        }

        Self {
            overall: or(self.overall, DEFAULT_OVERALL_TIMEOUT),
            setup_script: or(self.setup_script, DEFAULT_SETUP_SCRIPT_TIMEOUT),
            signal_file: or(self.signal_file, DEFAULT_SIGNAL_FILE_TIMEOUT),
            target_os: or(self.target_os, DEFAULT_TARGET_OS_TIMEOUT),
            power_off: or(self.power_off, DEFAULT_POWER_OFF_TIMEOUT),
        }
    }

    /// Longest time the bounded waits of one run can take
    ///
    /// The upgrade script itself is unbounded and not part of this sum.
    pub fn expected_duration(&self, delays: &SettleDelays) -> Duration {
        let t = self.resolved();
        t.setup_script
            + delays.shutdown_grace
            + t.power_off
            + delays.power_on_delay
            + delays.tools_settle
            + t.target_os
            + t.signal_file
    }

    /// Warn when the overall budget cannot cover the phase waits
    pub fn budget_warning(&self, delays: &SettleDelays) -> Option<BudgetWarning> {
        let overall = self.resolved().overall;
        let expected = self.expected_duration(delays);
        if overall > expected {
            None
        } else {
            Some(BudgetWarning { overall, expected })
        }
    }
}

/// The overall timeout does not exceed the sum of the phase waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetWarning {
    pub overall: Duration,
    pub expected: Duration,
}

impl std::fmt::Display for BudgetWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "overall timeout of {} min does not cover the {} min the phase waits can take; \
             machines may be cut off before the readiness check",
            self.overall.as_secs() / 60,
            self.expected.as_secs().div_ceil(60)
        )
    }
}

/// Guest timing tolerances and poll intervals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleDelays {
    /// Before the first power-state check after the script exits
    pub shutdown_grace: Duration,
    /// Between confirmed power-off and power-on
    pub power_on_delay: Duration,
    /// After power-on, for guest tooling to start
    pub tools_settle: Duration,
    /// Limit for a forced power-off or a power-on task
    pub forced_power_op: Duration,
    pub setup_poll: Duration,
    pub process_poll: Duration,
    pub power_poll: Duration,
    pub target_os_poll: Duration,
    pub signal_poll: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(60),
            power_on_delay: Duration::from_secs(60),
            tools_settle: Duration::from_secs(20),
            forced_power_op: minutes(10),
            setup_poll: Duration::from_secs(5),
            process_poll: Duration::from_secs(15),
            power_poll: Duration::from_secs(15),
            target_os_poll: Duration::from_secs(45),
            signal_poll: Duration::from_secs(30),
        }
    }
}

impl SettleDelays {
    /// Every delay and poll interval set to `delay`
    ///
    /// The forced power-operation limit keeps its default.
    pub fn uniform(delay: Duration) -> Self {
        Self {
            shutdown_grace: delay,
            power_on_delay: delay,
            tools_settle: delay,
            setup_poll: delay,
            process_poll: delay,
            power_poll: delay,
            target_os_poll: delay,
            signal_poll: delay,
            ..Self::default()
        }
    }
}
