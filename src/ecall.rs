//! The eCall signaling procedure as a hierarchical state machine: call
//! setup, minimum-data-set transmission with CRC/ack handling, redial on
//! failure and the PSAP callback window.

use std::cell::RefMut;
use std::fmt;

use static_assertions::const_assert_eq;
use tracing::debug;

use crate::config::{EcallConfig, FailureProfile, OperatingMode, RedialPolicy};
use crate::event::Event;
use crate::machine::{ParentLink, State, StateMachine, STATE_ID_INVALID};
use crate::service::{CallService, CallState, MsdStatus, RedialReason, SharedCallService, TimerAction};
use crate::timers::TimerId;

/// Fixed pacing between externally visible protocol actions.
const ACTION_PACE_MS: u64 = 1_000;

/// Qualifier naming the circuit-switched leg on an MSD pull request.
pub const CS_CALL_LEG: &str = "CSeCall";
/// Qualifier naming the next-generation (IMS) leg on an MSD pull request.
pub const NG_CALL_LEG: &str = "NGeCall";

/// Events the eCall state machine recognizes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcallEventId {
    HangupFromUser = 1,
    HangupFromPsap = 2,
    MsdPullRequest = 3,
    TimerExpiry = 4,
    NetworkDeregistration = 5,
}

impl EcallEventId {
    pub fn from_raw(id: u32) -> Option<EcallEventId> {
        match id {
            1 => Some(EcallEventId::HangupFromUser),
            2 => Some(EcallEventId::HangupFromPsap),
            3 => Some(EcallEventId::MsdPullRequest),
            4 => Some(EcallEventId::TimerExpiry),
            5 => Some(EcallEventId::NetworkDeregistration),
            _ => None,
        }
    }
}

/// State ids, fixed and gapless. `Idle` doubles as the pre-start
/// placeholder: before `start()` the machine reports it as the current id.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcallStateId {
    Idle = 0,
    ModemRedial = 1,
    CallConnect = 2,
    DecodeSendMsd = 3,
    CrcCheckOnMsd = 4,
    DecodeMsd = 5,
    CallConversation = 6,
    PsapCallback = 7,
}

const_assert_eq!(EcallStateId::Idle as u32, STATE_ID_INVALID);
const_assert_eq!(EcallStateId::PsapCallback as u32, 7);

/// Session attributes owned by the machine for the lifetime of one call
/// attempt.
#[derive(Debug, Clone)]
pub struct EcallSession {
    pub line_id: u8,
    pub call_index: u32,
    pub msd_required: bool,
    pub ng_call: bool,
    pub custom_number: bool,
    pub alack_cleardown: bool,
    pub policy: RedialPolicy,
    /// Per-attempt retry delays for the active policy, taken as given.
    pub redial_gaps_ms: Vec<u64>,
    pub failures: Vec<FailureProfile>,
    /// Guards concurrent MSD-pull handling.
    pub update_in_progress: bool,
    /// Set once a PSAP pull has (re)entered the decode path.
    pub msd_pull_requested: bool,
}

impl EcallSession {
    pub fn from_config(config: &EcallConfig) -> Self {
        Self {
            line_id: config.line_id,
            call_index: config.call_index,
            msd_required: config.msd_required,
            ng_call: config.ng_call,
            custom_number: config.custom_number,
            alack_cleardown: config.alack_cleardown,
            policy: config.policy,
            redial_gaps_ms: config.redial.gaps(config.policy).to_vec(),
            failures: config.failures.clone(),
            update_in_progress: false,
            msd_pull_requested: false,
        }
    }

    pub fn has_failure(&self, profile: FailureProfile) -> bool {
        self.failures.contains(&profile)
    }
}

/// What the states see: the session attributes plus the one call-service
/// reference injected at construction.
pub struct EcallContext {
    pub session: EcallSession,
    service: SharedCallService,
}

impl EcallContext {
    fn svc(&self) -> RefMut<'_, dyn CallService> {
        self.service.borrow_mut()
    }
}

impl fmt::Debug for EcallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcallContext")
            .field("session", &self.session)
            .finish()
    }
}

type Link = ParentLink<EcallContext>;

fn change_call_state(ctx: &mut EcallContext, state: CallState) {
    let line = ctx.session.line_id;
    let index = ctx.session.call_index;
    ctx.svc().change_call_state(line, state, index);
}

fn is_hangup(event: &Event) -> bool {
    matches!(
        EcallEventId::from_raw(event.id),
        Some(EcallEventId::HangupFromUser | EcallEventId::HangupFromPsap)
    )
}

/// Timer named by an `ON_TIMER_EXPIRY` event, if it carries one.
fn expired_timer(event: &Event) -> Option<TimerId> {
    if EcallEventId::from_raw(event.id) == Some(EcallEventId::TimerExpiry) {
        TimerId::from_name(event.name.as_str())
    } else {
        None
    }
}

fn hangup_to_callback(ctx: &mut EcallContext, link: &Link, stop_t2: bool) {
    change_call_state(ctx, CallState::Ended);
    if stop_t2 {
        ctx.svc().send_timer_event(TimerId::T2, TimerAction::Stop);
    }
    link.change_state(Box::new(PsapCallback::new(link.clone())));
}

/// Shared tail of a successful MSD decode: a pull-initiated cycle clears
/// the update flag, a spontaneous one may publish the AL-ACK clear-down.
fn finish_decode(ctx: &mut EcallContext) {
    if ctx.session.msd_pull_requested {
        ctx.session.update_in_progress = false;
    } else if ctx.session.alack_cleardown {
        ctx.svc().msd_transmission_status(MsdStatus::AlAckCleardown);
    }
}

/// Outbound leg of the call: publishes dialing/alerting, arms `T2` and,
/// on the way out, `T5` for CS calls that carry an MSD.
struct CallConnect {
    link: Link,
}

impl CallConnect {
    fn new(link: Link) -> Self {
        Self { link }
    }
}

impl State<EcallContext> for CallConnect {
    fn name(&self) -> &'static str {
        "CallConnect"
    }

    fn id(&self) -> u32 {
        EcallStateId::CallConnect as u32
    }

    fn on_enter(&mut self, ctx: &mut EcallContext) {
        change_call_state(ctx, CallState::Dialing);
        ctx.svc().pace(ACTION_PACE_MS);

        if ctx.session.policy == RedialPolicy::CallOrig {
            // Origination fails before alerting; go straight to callback.
            self.link
                .change_state(Box::new(PsapCallback::new(self.link.clone())));
            return;
        }

        change_call_state(ctx, CallState::Alerting);
        let line = ctx.session.line_id;
        ctx.svc()
            .on_ecall_redial(line, false, RedialReason::CallConnected);
        ctx.svc().pace(ACTION_PACE_MS);
        ctx.svc().start_timer(TimerId::T2);
        self.link
            .change_state(Box::new(DecodeSendMsd::new(self.link.clone())));
    }

    fn on_exit(&mut self, ctx: &mut EcallContext) {
        if ctx.session.ng_call || !ctx.session.msd_required {
            return;
        }

        if !ctx.session.has_failure(FailureProfile::T5Failed)
            && ctx.session.policy != RedialPolicy::CallDrop
        {
            ctx.svc().pace(ACTION_PACE_MS);
            ctx.svc().send_timer_event(TimerId::T5, TimerAction::Start);
        } else {
            // Failure-profiled sessions arm the real watcher instead.
            ctx.svc().pace(ACTION_PACE_MS);
            ctx.svc().start_timer(TimerId::T5);
        }
    }

    fn on_event(&mut self, ctx: &mut EcallContext, event: &Event) -> bool {
        debug!(state = self.name(), event = %event.name, "event");
        if is_hangup(event) {
            hangup_to_callback(ctx, &self.link, true);
        }
        true
    }
}

/// Chooses between in-band MSD transmission (CS), out-of-band transmission
/// (NG) and the voice-only path, honoring the configured failure profile.
struct DecodeSendMsd {
    link: Link,
}

impl DecodeSendMsd {
    fn new(link: Link) -> Self {
        Self { link }
    }
}

impl State<EcallContext> for DecodeSendMsd {
    fn name(&self) -> &'static str {
        "DecodeSendMSD"
    }

    fn id(&self) -> u32 {
        EcallStateId::DecodeSendMsd as u32
    }

    fn on_enter(&mut self, ctx: &mut EcallContext) {
        let ng = ctx.session.ng_call;
        let msd = ctx.session.msd_required;
        let custom = ctx.session.custom_number;
        let policy = ctx.session.policy;
        let pull = ctx.session.msd_pull_requested;
        let t5_failed = ctx.session.has_failure(FailureProfile::T5Failed);

        if !ng {
            if msd {
                if pull {
                    ctx.svc().msd_transmission_status(MsdStatus::StartReceived);
                    ctx.svc().pace(ACTION_PACE_MS);
                    ctx.svc()
                        .msd_transmission_status(MsdStatus::TransmissionStarted);
                    self.link
                        .change_state(Box::new(CrcCheckOnMsd::new(self.link.clone())));
                } else {
                    ctx.svc().pace(ACTION_PACE_MS);
                    ctx.svc()
                        .msd_transmission_status(MsdStatus::TransmissionStarted);
                    ctx.svc().pace(ACTION_PACE_MS);
                    change_call_state(ctx, CallState::Active);
                    if !t5_failed && policy == RedialPolicy::Success {
                        ctx.svc().pace(ACTION_PACE_MS);
                        ctx.svc().msd_transmission_status(MsdStatus::StartReceived);
                        ctx.svc().pace(ACTION_PACE_MS);
                        ctx.svc().send_timer_event(TimerId::T5, TimerAction::Stop);
                        self.link
                            .change_state(Box::new(CrcCheckOnMsd::new(self.link.clone())));
                    }
                    // Otherwise hold here until the armed T5 watcher fires.
                }
            } else if !custom && pull {
                ctx.svc().pace(ACTION_PACE_MS);
                ctx.svc()
                    .msd_transmission_status(MsdStatus::TransmissionStarted);
                self.link
                    .change_state(Box::new(CrcCheckOnMsd::new(self.link.clone())));
            } else {
                ctx.svc().pace(ACTION_PACE_MS);
                change_call_state(ctx, CallState::Active);
                self.link
                    .change_state(Box::new(CallConversation::new(self.link.clone())));
            }
        } else if msd {
            if !custom {
                ctx.svc().pace(ACTION_PACE_MS);
                ctx.svc()
                    .msd_transmission_status(MsdStatus::OutbandTransmissionStarted);
            }
            ctx.svc().pace(ACTION_PACE_MS);
            change_call_state(ctx, CallState::Active);
            if policy == RedialPolicy::CallDrop {
                ctx.svc()
                    .msd_transmission_status(MsdStatus::OutbandTransmissionFailure);
                self.link
                    .change_state(Box::new(PsapCallback::new(self.link.clone())));
            } else {
                self.link
                    .change_state(Box::new(DecodeMsd::new(self.link.clone())));
            }
        } else {
            ctx.svc().pace(ACTION_PACE_MS);
            change_call_state(ctx, CallState::Active);
            self.link
                .change_state(Box::new(CallConversation::new(self.link.clone())));
        }
    }

    fn on_event(&mut self, ctx: &mut EcallContext, event: &Event) -> bool {
        debug!(state = self.name(), event = %event.name, "event");

        let drop_configured = ctx.session.has_failure(FailureProfile::T5Failed)
            || ctx.session.policy == RedialPolicy::CallDrop;
        if drop_configured && expired_timer(event) == Some(TimerId::T5) {
            ctx.svc().pace(ACTION_PACE_MS);
            ctx.svc().expire_timer(TimerId::T5);
            ctx.svc().pace(ACTION_PACE_MS);
            ctx.svc()
                .msd_transmission_status(MsdStatus::TransmissionFailure);
            if ctx.session.policy == RedialPolicy::CallDrop {
                self.link
                    .change_state(Box::new(PsapCallback::new(self.link.clone())));
            } else {
                self.link
                    .change_state(Box::new(CallConversation::new(self.link.clone())));
            }
        }

        if is_hangup(event) {
            hangup_to_callback(ctx, &self.link, true);
        }
        true
    }
}

/// Low-layer acknowledgement window around the MSD transfer, bounded by `T7`.
struct CrcCheckOnMsd {
    link: Link,
}

impl CrcCheckOnMsd {
    fn new(link: Link) -> Self {
        Self { link }
    }
}

impl State<EcallContext> for CrcCheckOnMsd {
    fn name(&self) -> &'static str {
        "CRCCheckonMSD"
    }

    fn id(&self) -> u32 {
        EcallStateId::CrcCheckOnMsd as u32
    }

    fn on_enter(&mut self, ctx: &mut EcallContext) {
        if !ctx.session.has_failure(FailureProfile::T7Failed) {
            if ctx.session.msd_pull_requested {
                ctx.svc().send_timer_event(TimerId::T7, TimerAction::Start);
                ctx.svc().pace(ACTION_PACE_MS);
            } else {
                ctx.svc().pace(ACTION_PACE_MS);
                ctx.svc().send_timer_event(TimerId::T7, TimerAction::Start);
            }
            self.link
                .change_state(Box::new(DecodeMsd::new(self.link.clone())));
        } else {
            ctx.svc().start_timer(TimerId::T7);
        }
    }

    fn on_exit(&mut self, ctx: &mut EcallContext) {
        if !ctx.session.has_failure(FailureProfile::T7Failed) {
            ctx.svc().pace(ACTION_PACE_MS);
            ctx.svc().send_timer_event(TimerId::T7, TimerAction::Stop);
            ctx.svc().pace(ACTION_PACE_MS);
            ctx.svc()
                .msd_transmission_status(MsdStatus::LowLayerAckReceived);
        }
    }

    fn on_event(&mut self, ctx: &mut EcallContext, event: &Event) -> bool {
        debug!(state = self.name(), event = %event.name, "event");

        if expired_timer(event) == Some(TimerId::T7) {
            ctx.svc()
                .msd_transmission_status(MsdStatus::LowLayerNackT7Expiry);
            ctx.svc().expire_timer(TimerId::T7);
            ctx.svc()
                .msd_transmission_status(MsdStatus::TransmissionFailure);
            self.link
                .change_state(Box::new(CallConversation::new(self.link.clone())));
        }

        if is_hangup(event) {
            hangup_to_callback(ctx, &self.link, true);
        }
        true
    }
}

/// PSAP-side decode of the MSD, bounded by `T6` on the CS path.
struct DecodeMsd {
    link: Link,
}

impl DecodeMsd {
    fn new(link: Link) -> Self {
        Self { link }
    }
}

impl State<EcallContext> for DecodeMsd {
    fn name(&self) -> &'static str {
        "DecodeMSD"
    }

    fn id(&self) -> u32 {
        EcallStateId::DecodeMsd as u32
    }

    fn on_enter(&mut self, ctx: &mut EcallContext) {
        if !ctx.session.ng_call {
            if !ctx.session.has_failure(FailureProfile::T6Failed) {
                ctx.svc().pace(ACTION_PACE_MS);
                ctx.svc().send_timer_event(TimerId::T6, TimerAction::Start);
                ctx.svc().pace(ACTION_PACE_MS);
                ctx.svc()
                    .msd_transmission_status(MsdStatus::TransmissionSuccess);
                ctx.svc().pace(ACTION_PACE_MS);
                ctx.svc().send_timer_event(TimerId::T6, TimerAction::Stop);
                finish_decode(ctx);
                self.link
                    .change_state(Box::new(CallConversation::new(self.link.clone())));
            } else if !ctx.session.custom_number {
                ctx.svc().start_timer(TimerId::T6);
            }
        } else {
            ctx.svc().pace(ACTION_PACE_MS);
            ctx.svc()
                .msd_transmission_status(MsdStatus::OutbandTransmissionSuccess);
            finish_decode(ctx);
            self.link
                .change_state(Box::new(CallConversation::new(self.link.clone())));
        }
    }

    fn on_event(&mut self, ctx: &mut EcallContext, event: &Event) -> bool {
        debug!(state = self.name(), event = %event.name, "event");

        if !ctx.session.custom_number
            && !ctx.session.ng_call
            && expired_timer(event) == Some(TimerId::T6)
        {
            ctx.svc().expire_timer(TimerId::T6);
            ctx.svc()
                .msd_transmission_status(MsdStatus::TransmissionFailure);
            self.link
                .change_state(Box::new(CallConversation::new(self.link.clone())));
        }

        if is_hangup(event) {
            // Custom-number NG calls never started T2.
            let stop_t2 = !(ctx.session.custom_number && ctx.session.ng_call);
            hangup_to_callback(ctx, &self.link, stop_t2);
        }
        true
    }
}

/// Stable voice call. Ends on hangup or `T2` expiry; a new PSAP pull
/// re-enters the decode path (CS) or re-sends out-of-band inline (NG).
struct CallConversation {
    link: Link,
}

impl CallConversation {
    fn new(link: Link) -> Self {
        Self { link }
    }
}

impl State<EcallContext> for CallConversation {
    fn name(&self) -> &'static str {
        "CallConversation"
    }

    fn id(&self) -> u32 {
        EcallStateId::CallConversation as u32
    }

    fn on_enter(&mut self, ctx: &mut EcallContext) {
        if ctx.session.alack_cleardown {
            // AL-ACK with clear-down ends the call right after it connects.
            self.link
                .change_state(Box::new(PsapCallback::new(self.link.clone())));
        }
    }

    fn on_event(&mut self, ctx: &mut EcallContext, event: &Event) -> bool {
        debug!(state = self.name(), event = %event.name, "event");

        match EcallEventId::from_raw(event.id) {
            Some(EcallEventId::TimerExpiry) => {
                if expired_timer(event) == Some(TimerId::T2) {
                    ctx.svc().expire_timer(TimerId::T2);
                    change_call_state(ctx, CallState::Ended);
                    self.link
                        .change_state(Box::new(PsapCallback::new(self.link.clone())));
                } else {
                    debug!(timer = %event.name, "unrecognized timer expiry ignored");
                }
            }
            Some(EcallEventId::HangupFromUser | EcallEventId::HangupFromPsap) => {
                self.link
                    .change_state(Box::new(PsapCallback::new(self.link.clone())));
            }
            Some(EcallEventId::MsdPullRequest) => {
                ctx.session.msd_pull_requested = true;
                if event.name.as_str() == CS_CALL_LEG {
                    ctx.session.update_in_progress = true;
                    self.link
                        .change_state(Box::new(DecodeSendMsd::new(self.link.clone())));
                } else {
                    ctx.session.update_in_progress = true;
                    if !ctx.session.custom_number {
                        ctx.svc()
                            .msd_transmission_status(MsdStatus::OutbandTransmissionStarted);
                        ctx.svc().pace(ACTION_PACE_MS);
                    }
                    ctx.svc()
                        .msd_transmission_status(MsdStatus::OutbandTransmissionSuccess);
                    ctx.session.update_in_progress = false;
                }
            }
            _ => {
                debug!(id = event.id, "unrecognized event ignored");
            }
        }
        true
    }
}

/// Post-call window: arms the callback timers, publishes the redial intent
/// and ends the call; any policy other than `SUCCESS` falls into the retry
/// loop.
struct PsapCallback {
    link: Link,
}

impl PsapCallback {
    fn new(link: Link) -> Self {
        Self { link }
    }
}

impl State<EcallContext> for PsapCallback {
    fn name(&self) -> &'static str {
        "PSAPCallback"
    }

    fn id(&self) -> u32 {
        EcallStateId::PsapCallback as u32
    }

    fn on_enter(&mut self, ctx: &mut EcallContext) {
        let line = ctx.session.line_id;
        let policy = ctx.session.policy;

        ctx.svc().start_timer(TimerId::T9);
        let mode = ctx.svc().operating_mode(line);
        if policy == RedialPolicy::Success && mode == OperatingMode::EcallOnly {
            ctx.svc().start_timer(TimerId::T10);
        }

        if policy == RedialPolicy::CallOrig {
            ctx.svc()
                .on_ecall_redial(line, true, RedialReason::CallOrigFailure);
        } else {
            ctx.svc().send_timer_event(TimerId::T2, TimerAction::Stop);
            if policy == RedialPolicy::CallDrop {
                ctx.svc().on_ecall_redial(line, true, RedialReason::CallDrop);
            }
        }

        ctx.svc().pace(ACTION_PACE_MS);
        change_call_state(ctx, CallState::Ended);
        ctx.svc().pace(ACTION_PACE_MS);

        if policy != RedialPolicy::Success {
            self.link
                .change_state(Box::new(ModemRedial::new(self.link.clone())));
        }
    }

    fn on_event(&mut self, ctx: &mut EcallContext, event: &Event) -> bool {
        debug!(state = self.name(), event = %event.name, "event");
        let line = ctx.session.line_id;

        match EcallEventId::from_raw(event.id) {
            Some(EcallEventId::TimerExpiry) => match expired_timer(event) {
                Some(TimerId::T9) => {
                    let mode = ctx.svc().operating_mode(line);
                    if mode != OperatingMode::EcallOnly {
                        ctx.svc().expire_timer(TimerId::T9);
                        self.link.stop();
                    }
                }
                Some(TimerId::T10) => {
                    ctx.svc().expire_timer(TimerId::T10);
                    let mode = ctx.svc().operating_mode(line);
                    if mode == OperatingMode::EcallOnly {
                        self.link.stop();
                    }
                }
                _ => {
                    debug!(timer = %event.name, "unrecognized timer expiry ignored");
                }
            },
            Some(EcallEventId::NetworkDeregistration) => {
                if event.name.as_str() == TimerId::T10.as_str() {
                    ctx.svc().send_timer_event(TimerId::T10, TimerAction::Stop);
                }
            }
            _ => {
                debug!(id = event.id, "unrecognized event ignored");
            }
        }
        true
    }
}

/// The retry loop. Entry walks the whole configured schedule: every attempt
/// but the last publishes a will-redial notice and ends the call, the last
/// one publishes the exhausted notice and, under eCall-only mode with
/// origination failures, leaves `T10` running for the callback window.
struct ModemRedial {
    link: Link,
}

impl ModemRedial {
    fn new(link: Link) -> Self {
        Self { link }
    }
}

impl State<EcallContext> for ModemRedial {
    fn name(&self) -> &'static str {
        "ModemRedial"
    }

    fn id(&self) -> u32 {
        EcallStateId::ModemRedial as u32
    }

    fn on_enter(&mut self, ctx: &mut EcallContext) {
        let line = ctx.session.line_id;
        let policy = ctx.session.policy;
        let mode = ctx.svc().operating_mode(line);
        let gaps = ctx.session.redial_gaps_ms.clone();
        let total = gaps.len();
        let orig_under_ecall_only =
            mode == OperatingMode::EcallOnly && policy == RedialPolicy::CallOrig;

        for (index, gap) in gaps.iter().enumerate() {
            ctx.svc().pace(*gap);
            let last = index + 1 == total;

            if !last {
                if orig_under_ecall_only {
                    ctx.svc().send_timer_event(TimerId::T10, TimerAction::Start);
                }
                change_call_state(ctx, CallState::Dialing);
                ctx.svc().pace(ACTION_PACE_MS);
                if policy == RedialPolicy::CallOrig {
                    ctx.svc()
                        .on_ecall_redial(line, true, RedialReason::CallOrigFailure);
                    if mode == OperatingMode::EcallOnly {
                        ctx.svc().send_timer_event(TimerId::T10, TimerAction::Stop);
                    }
                } else {
                    ctx.svc().on_ecall_redial(line, true, RedialReason::CallDrop);
                }
                ctx.svc().pace(ACTION_PACE_MS);
                change_call_state(ctx, CallState::Ended);
            } else {
                ctx.svc().pace(ACTION_PACE_MS);
                change_call_state(ctx, CallState::Dialing);
                ctx.svc().pace(ACTION_PACE_MS);
                ctx.svc()
                    .on_ecall_redial(line, false, RedialReason::MaxRedialAttempted);
                ctx.svc().pace(ACTION_PACE_MS);
                change_call_state(ctx, CallState::Ended);
                if orig_under_ecall_only {
                    ctx.svc().start_timer(TimerId::T10);
                }
            }
        }
    }

    fn on_event(&mut self, ctx: &mut EcallContext, event: &Event) -> bool {
        debug!(state = self.name(), event = %event.name, "event");

        // Expiries here only settle the timer bookkeeping.
        match expired_timer(event) {
            Some(TimerId::T9) => ctx.svc().expire_timer(TimerId::T9),
            Some(TimerId::T10) => ctx.svc().expire_timer(TimerId::T10),
            _ => debug!(id = event.id, "unrecognized event ignored"),
        }
        true
    }
}

/// One eCall attempt. Created and started per outbound or inbound attempt,
/// stopped when the call ends or a new attempt supersedes it.
pub struct EcallStateMachine {
    machine: StateMachine<EcallContext>,
    ctx: EcallContext,
}

impl EcallStateMachine {
    pub fn new(service: SharedCallService, session: EcallSession) -> Self {
        Self {
            machine: StateMachine::new("EcallStateMachine"),
            ctx: EcallContext { session, service },
        }
    }

    /// Starts the machine and performs the idle bootstrap: enters
    /// `CallConnect` and applies the one transition its entry actions
    /// request, leaving the machine in the first real protocol state.
    pub fn start(&mut self) {
        if self.machine.is_started() {
            debug!("start ignored: machine already running");
            return;
        }
        self.machine.start();
        let first = CallConnect::new(self.machine.link());
        self.machine.change_state(Some(Box::new(first)), &mut self.ctx);
        self.machine.pump(&mut self.ctx);
    }

    pub fn stop(&mut self) {
        self.machine.stop(&mut self.ctx);
    }

    pub fn is_started(&self) -> bool {
        self.machine.is_started()
    }

    /// Top-level event handler: routes the event to the active state, then
    /// applies every transition the handler requested.
    pub fn on_event(&mut self, event: &Event) -> bool {
        debug!(event = %event.name, id = event.id, "event received");
        let handled = self.machine.on_event(&mut self.ctx, event);
        self.machine.settle(&mut self.ctx);
        handled
    }

    /// Applies one pending transition. Returns whether one was applied.
    pub fn pump(&mut self) -> bool {
        self.machine.pump(&mut self.ctx)
    }

    /// Drives pending transitions and queued timer expiries until the
    /// machine has nothing left to do at the current simulated time.
    pub fn run_until_idle(&mut self) {
        loop {
            if self.machine.pump(&mut self.ctx) {
                continue;
            }
            let next = self.ctx.svc().poll_event();
            match next {
                Some(event) => {
                    self.on_event(&event);
                }
                None => break,
            }
        }
    }

    /// Deepest active state id; `EcallStateId::Idle as u32` before start.
    pub fn current_state_id(&self) -> u32 {
        self.machine.current_state_id()
    }

    pub fn active_chain(&self) -> String {
        self.machine.active_chain()
    }

    pub fn session(&self) -> &EcallSession {
        &self.ctx.session
    }

    /// Whether an MSD pull cycle is currently in flight.
    pub fn msd_update_in_progress(&self) -> bool {
        self.ctx.session.update_in_progress
    }

    /// Factory for the protocol events this machine recognizes.
    pub fn create_event(id: EcallEventId, tag: &str, line: u8) -> Event {
        Event::new(id as u32, tag, line)
    }
}

impl fmt::Debug for EcallStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcallStateMachine")
            .field("chain", &self.active_chain())
            .field("started", &self.is_started())
            .finish()
    }
}
