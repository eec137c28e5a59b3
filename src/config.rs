use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timers::{TimerId, MSD_TIMER_EXPIRY_MS};

/// Shortest allowed gap before the first redial attempt.
pub const MIN_FIRST_GAP_MS: u64 = 5_000;
/// Shortest allowed gap for attempts two through four.
pub const MIN_EARLY_GAP_MS: u64 = 60_000;
/// Shortest allowed gap for every later attempt.
pub const MIN_LATE_GAP_MS: u64 = 180_000;

const EARLY_GAP_ATTEMPTS: usize = 4;

/// Redial policy token configured for a session. `SUCCESS` connects without
/// redialing, `CALLORIG` simulates origination failures, `CALLDROP`
/// simulates an established call dropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedialPolicy {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "CALLORIG")]
    CallOrig,
    #[serde(rename = "CALLDROP")]
    CallDrop,
}

impl RedialPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedialPolicy::Success => "SUCCESS",
            RedialPolicy::CallOrig => "CALLORIG",
            RedialPolicy::CallDrop => "CALLDROP",
        }
    }
}

/// Per-line eCall operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Normal,
    EcallOnly,
}

/// Configured timer-failure profile entries. A session carrying one of
/// these lets the matching HLAP timer run to expiry instead of completing
/// the protocol step it bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureProfile {
    #[serde(rename = "T5FAILED")]
    T5Failed,
    #[serde(rename = "T6FAILED")]
    T6Failed,
    #[serde(rename = "T7FAILED")]
    T7Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("redial schedule for {policy} is empty")]
    EmptySchedule { policy: &'static str },
    #[error(
        "redial gap {attempt} for {policy} is {configured_ms} ms, below the {minimum_ms} ms minimum"
    )]
    GapTooShort {
        policy: &'static str,
        attempt: usize,
        configured_ms: u64,
        minimum_ms: u64,
    },
}

/// Per-attempt redial delays, keyed by policy. The state machine trusts
/// whatever list it is given; callers accept a schedule only after
/// [`RedialConfig::validate`] passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedialConfig {
    pub call_orig_gaps_ms: Vec<u64>,
    pub call_drop_gaps_ms: Vec<u64>,
}

impl RedialConfig {
    pub fn gaps(&self, policy: RedialPolicy) -> &[u64] {
        match policy {
            RedialPolicy::Success => &[],
            RedialPolicy::CallOrig => &self.call_orig_gaps_ms,
            RedialPolicy::CallDrop => &self.call_drop_gaps_ms,
        }
    }

    pub fn attempts(&self, policy: RedialPolicy) -> usize {
        self.gaps(policy).len()
    }

    /// Checks both schedules against the protocol-mandated minimum gaps:
    /// 5 s before the first attempt, 60 s for the next three, 180 s after.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for policy in [RedialPolicy::CallOrig, RedialPolicy::CallDrop] {
            Self::validate_gaps(policy.as_str(), self.gaps(policy))?;
        }
        Ok(())
    }

    fn validate_gaps(policy: &'static str, gaps: &[u64]) -> Result<(), ConfigError> {
        if gaps.is_empty() {
            return Err(ConfigError::EmptySchedule { policy });
        }

        for (index, &gap) in gaps.iter().enumerate() {
            let minimum = if index == 0 {
                MIN_FIRST_GAP_MS
            } else if index < EARLY_GAP_ATTEMPTS {
                MIN_EARLY_GAP_MS
            } else {
                MIN_LATE_GAP_MS
            };

            if gap < minimum {
                return Err(ConfigError::GapTooShort {
                    policy,
                    attempt: index + 1,
                    configured_ms: gap,
                    minimum_ms: minimum,
                });
            }
        }

        Ok(())
    }
}

impl Default for RedialConfig {
    fn default() -> Self {
        Self {
            call_orig_gaps_ms: vec![5_000, 60_000, 60_000, 60_000, 180_000],
            call_drop_gaps_ms: vec![5_000, 60_000, 60_000, 60_000, 180_000],
        }
    }
}

/// Expiry delays for the configuration-driven HLAP timers. `T5`/`T6` are
/// fixed at [`MSD_TIMER_EXPIRY_MS`] and not configurable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimerConfig {
    pub t2_ms: u64,
    pub t7_ms: u64,
    pub t9_ms: u64,
    pub t10_ms: u64,
}

impl TimerConfig {
    pub fn expiry_delay_ms(&self, timer: TimerId) -> u64 {
        match timer {
            TimerId::T2 => self.t2_ms,
            TimerId::T5 | TimerId::T6 => MSD_TIMER_EXPIRY_MS,
            TimerId::T7 => self.t7_ms,
            TimerId::T9 => self.t9_ms,
            TimerId::T10 => self.t10_ms,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t2_ms: 3_600_000,
            t7_ms: 20_000,
            t9_ms: 3_600_000,
            t10_ms: 43_200_000,
        }
    }
}

/// Everything one eCall attempt needs, supplied pre-parsed by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcallConfig {
    pub line_id: u8,
    pub call_index: u32,
    pub msd_required: bool,
    pub ng_call: bool,
    pub custom_number: bool,
    pub alack_cleardown: bool,
    pub policy: RedialPolicy,
    pub operating_mode: OperatingMode,
    #[serde(default)]
    pub failures: Vec<FailureProfile>,
    #[serde(default)]
    pub redial: RedialConfig,
    #[serde(default)]
    pub timers: TimerConfig,
}

impl Default for EcallConfig {
    fn default() -> Self {
        Self {
            line_id: 1,
            call_index: 1,
            msd_required: true,
            ng_call: false,
            custom_number: false,
            alack_cleardown: false,
            policy: RedialPolicy::Success,
            operating_mode: OperatingMode::Normal,
            failures: Vec::new(),
            redial: RedialConfig::default(),
            timers: TimerConfig::default(),
        }
    }
}
