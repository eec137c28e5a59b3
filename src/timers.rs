use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const TIMER_COUNT: usize = 6;

/// `T5`/`T6` expire five seconds after arming, per the eCall specification.
pub const MSD_TIMER_EXPIRY_MS: u64 = 5_000;

const MAX_WATCHERS: usize = 8;

/// HLAP timers bounding call setup, MSD transmission, acknowledgement and
/// the post-call callback windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerId {
    T2,
    T5,
    T6,
    T7,
    T9,
    T10,
}

impl TimerId {
    pub const ALL: [TimerId; TIMER_COUNT] = [
        TimerId::T2,
        TimerId::T5,
        TimerId::T6,
        TimerId::T7,
        TimerId::T9,
        TimerId::T10,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerId::T2 => "T2",
            TimerId::T5 => "T5",
            TimerId::T6 => "T6",
            TimerId::T7 => "T7",
            TimerId::T9 => "T9",
            TimerId::T10 => "T10",
        }
    }

    pub fn from_name(name: &str) -> Option<TimerId> {
        match name {
            "T2" => Some(TimerId::T2),
            "T5" => Some(TimerId::T5),
            "T6" => Some(TimerId::T6),
            "T7" => Some(TimerId::T7),
            "T9" => Some(TimerId::T9),
            "T10" => Some(TimerId::T10),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            TimerId::T2 => 0,
            TimerId::T5 => 1,
            TimerId::T6 => 2,
            TimerId::T7 => 3,
            TimerId::T9 => 4,
            TimerId::T10 => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerStatus {
    Active,
    Inactive,
}

/// Persisted HLAP timer-status table. The call service is the only writer;
/// expiry watchers read it back before firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerTable {
    status: [TimerStatus; TIMER_COUNT],
}

impl TimerTable {
    pub fn new() -> Self {
        Self {
            status: [TimerStatus::Inactive; TIMER_COUNT],
        }
    }

    pub fn set(&mut self, timer: TimerId, status: TimerStatus) {
        self.status[timer.index()] = status;
    }

    pub fn get(&self, timer: TimerId) -> TimerStatus {
        self.status[timer.index()]
    }

    pub fn is_active(&self, timer: TimerId) -> bool {
        self.get(timer) == TimerStatus::Active
    }
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct Watcher {
    timer: TimerId,
    deadline_ms: u64,
}

/// Armed expiry watchers. A watcher fires once its deadline passes and the
/// persisted status is still `Active`; a timer turned `Inactive` first makes
/// its watcher a no-op, which is how in-flight timers are cancelled.
#[derive(Debug)]
pub struct ExpiryWatchdog {
    watchers: Vec<Watcher, MAX_WATCHERS>,
}

impl ExpiryWatchdog {
    pub fn new() -> Self {
        Self {
            watchers: Vec::new(),
        }
    }

    /// Arms (or re-arms) the watcher for `timer`.
    pub fn arm(&mut self, timer: TimerId, deadline_ms: u64) {
        self.watchers.retain(|watcher| watcher.timer != timer);
        // One slot per timer, so the push cannot fail after the retain.
        let _ = self.watchers.push(Watcher { timer, deadline_ms });
    }

    /// Fires watchers due at `now_ms`. Fired timers are flipped to
    /// `Inactive` in the table; watchers whose timer was already inactive
    /// are discarded without firing.
    pub fn poll(&mut self, now_ms: u64, table: &mut TimerTable) -> Vec<TimerId, TIMER_COUNT> {
        let mut fired: Vec<TimerId, TIMER_COUNT> = Vec::new();
        let mut remaining: Vec<Watcher, MAX_WATCHERS> = Vec::new();

        for watcher in self.watchers.iter() {
            if watcher.deadline_ms <= now_ms {
                if table.is_active(watcher.timer) {
                    table.set(watcher.timer, TimerStatus::Inactive);
                    let _ = fired.push(watcher.timer);
                } else {
                    debug!(
                        timer = watcher.timer.as_str(),
                        "expiry watcher found timer inactive, dropping"
                    );
                }
            } else {
                let _ = remaining.push(*watcher);
            }
        }

        self.watchers = remaining;
        fired
    }

    pub fn armed_count(&self) -> usize {
        self.watchers.len()
    }
}

impl Default for ExpiryWatchdog {
    fn default() -> Self {
        Self::new()
    }
}
