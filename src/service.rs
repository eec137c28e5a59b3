use std::cell::RefCell;
use std::rc::Rc;

use heapless::Deque;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{EcallConfig, OperatingMode, TimerConfig};
use crate::ecall::EcallEventId;
use crate::event::Event;
use crate::timers::{ExpiryWatchdog, TimerId, TimerStatus, TimerTable};

const MAX_PENDING_EVENTS: usize = 16;

/// Externally visible call states published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    Dialing,
    Alerting,
    Active,
    Ended,
}

/// Reason attached to a redial-intent notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedialReason {
    CallConnected,
    CallOrigFailure,
    CallDrop,
    MaxRedialAttempted,
}

/// MSD lifecycle tags published while a transmission is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsdStatus {
    TransmissionStarted,
    StartReceived,
    TransmissionSuccess,
    TransmissionFailure,
    OutbandTransmissionStarted,
    OutbandTransmissionSuccess,
    OutbandTransmissionFailure,
    LowLayerAckReceived,
    LowLayerNackT7Expiry,
    AlAckCleardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerAction {
    Start,
    Stop,
}

/// Timer lifecycle change published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerEvent {
    Started,
    Stopped,
    Expired,
}

/// One entry in the notification journal, in publication order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    CallState {
        line: u8,
        state: CallState,
        call_index: u32,
    },
    Timer {
        timer: TimerId,
        event: TimerEvent,
    },
    Msd {
        status: MsdStatus,
    },
    Redial {
        line: u8,
        will_redial: bool,
        reason: RedialReason,
    },
}

pub type SharedCallService = Rc<RefCell<dyn CallService>>;

/// Interface the protocol state machine drives. All calls are synchronous
/// from the machine's point of view; expiry delivery comes back through
/// [`CallService::poll_event`] on the externally serialized path.
pub trait CallService {
    /// Mutates the externally visible call state and notifies subscribers.
    fn change_call_state(&mut self, line: u8, state: CallState, call_index: u32);

    /// Persists the timer as active and arms its background expiry watcher.
    /// Starting `T2` additionally resets the callback-window timers
    /// (`T9`/`T10`) left over from a previous attempt.
    fn start_timer(&mut self, timer: TimerId);

    /// Persists a start/stop without arming a watcher.
    fn send_timer_event(&mut self, timer: TimerId, action: TimerAction);

    /// Persists the timer as inactive and publishes its expiry.
    fn expire_timer(&mut self, timer: TimerId);

    fn msd_transmission_status(&mut self, status: MsdStatus);

    fn on_ecall_redial(&mut self, line: u8, will_redial: bool, reason: RedialReason);

    fn operating_mode(&self, line: u8) -> OperatingMode;

    fn timer_status(&self, timer: TimerId) -> TimerStatus;

    /// Lets simulated protocol time elapse between externally visible
    /// actions. Watchers that come due are queued for later delivery, never
    /// delivered from inside the call.
    fn pace(&mut self, ms: u64);

    fn now_ms(&self) -> u64;

    /// Next timer-expiry event waiting for delivery, if any.
    fn poll_event(&mut self) -> Option<Event>;
}

/// Deterministic in-process call service: a logical clock, the persisted
/// timer table, armed expiry watchers and an ordered notification journal.
pub struct SimulatedCallService {
    line: u8,
    now_ms: u64,
    mode: OperatingMode,
    timer_config: TimerConfig,
    timers: TimerTable,
    watchdog: ExpiryWatchdog,
    pending: Deque<Event, MAX_PENDING_EVENTS>,
    journal: Vec<Notification>,
}

impl SimulatedCallService {
    pub fn new(config: &EcallConfig) -> Self {
        Self {
            line: config.line_id,
            now_ms: 0,
            mode: config.operating_mode,
            timer_config: config.timers,
            timers: TimerTable::new(),
            watchdog: ExpiryWatchdog::new(),
            pending: Deque::new(),
            journal: Vec::new(),
        }
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.journal
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.journal)
    }

    /// Most recently published call state, if any.
    pub fn last_call_state(&self) -> Option<CallState> {
        self.journal.iter().rev().find_map(|entry| match entry {
            Notification::CallState { state, .. } => Some(*state),
            _ => None,
        })
    }

    /// Driver-facing alias for [`CallService::pace`].
    pub fn advance(&mut self, ms: u64) {
        self.pace(ms);
    }

    pub fn set_operating_mode(&mut self, mode: OperatingMode) {
        self.mode = mode;
    }

    fn record(&mut self, notification: Notification) {
        debug!(?notification, "notify");
        self.journal.push(notification);
    }

    fn queue_due_expiries(&mut self) {
        let fired = self.watchdog.poll(self.now_ms, &mut self.timers);
        for timer in fired {
            let event = Event::new(
                EcallEventId::TimerExpiry as u32,
                timer.as_str(),
                self.line,
            );
            if self.pending.push_back(event).is_err() {
                warn!(
                    timer = timer.as_str(),
                    "pending event queue full, dropping expiry"
                );
            }
        }
    }
}

impl CallService for SimulatedCallService {
    fn change_call_state(&mut self, line: u8, state: CallState, call_index: u32) {
        self.record(Notification::CallState {
            line,
            state,
            call_index,
        });
    }

    fn start_timer(&mut self, timer: TimerId) {
        self.timers.set(timer, TimerStatus::Active);
        let deadline = self
            .now_ms
            .saturating_add(self.timer_config.expiry_delay_ms(timer));
        self.watchdog.arm(timer, deadline);
        self.record(Notification::Timer {
            timer,
            event: TimerEvent::Started,
        });

        // A fresh call setup resets the callback-window timers.
        if timer == TimerId::T2 {
            for callback_timer in [TimerId::T9, TimerId::T10] {
                if self.timers.is_active(callback_timer) {
                    self.timers.set(callback_timer, TimerStatus::Inactive);
                    self.record(Notification::Timer {
                        timer: callback_timer,
                        event: TimerEvent::Stopped,
                    });
                }
            }
        }
    }

    fn send_timer_event(&mut self, timer: TimerId, action: TimerAction) {
        let event = match action {
            TimerAction::Start => {
                self.timers.set(timer, TimerStatus::Active);
                TimerEvent::Started
            }
            TimerAction::Stop => {
                self.timers.set(timer, TimerStatus::Inactive);
                TimerEvent::Stopped
            }
        };
        self.record(Notification::Timer { timer, event });
    }

    fn expire_timer(&mut self, timer: TimerId) {
        self.timers.set(timer, TimerStatus::Inactive);
        self.record(Notification::Timer {
            timer,
            event: TimerEvent::Expired,
        });
    }

    fn msd_transmission_status(&mut self, status: MsdStatus) {
        self.record(Notification::Msd { status });
    }

    fn on_ecall_redial(&mut self, line: u8, will_redial: bool, reason: RedialReason) {
        self.record(Notification::Redial {
            line,
            will_redial,
            reason,
        });
    }

    fn operating_mode(&self, _line: u8) -> OperatingMode {
        self.mode
    }

    fn timer_status(&self, timer: TimerId) -> TimerStatus {
        self.timers.get(timer)
    }

    fn pace(&mut self, ms: u64) {
        self.now_ms = self.now_ms.saturating_add(ms);
        self.queue_due_expiries();
    }

    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn poll_event(&mut self) -> Option<Event> {
        self.pending.pop_front()
    }
}

impl std::fmt::Debug for SimulatedCallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedCallService")
            .field("line", &self.line)
            .field("now_ms", &self.now_ms)
            .field("mode", &self.mode)
            .field("pending", &self.pending.len())
            .field("journal", &self.journal.len())
            .finish()
    }
}
