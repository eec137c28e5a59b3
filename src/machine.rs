use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::event::Event;

/// Reported by [`StateMachine::current_state_id`] when no state is active.
pub const STATE_ID_INVALID: u32 = 0;

/// A node in a hierarchical state machine.
///
/// A state may itself own a nested [`StateMachine`] (a composite state); the
/// engine discovers it through [`State::machine`] and uses it to cascade
/// exit hooks and to report the deepest active state id.
pub trait State<C> {
    fn name(&self) -> &'static str;

    /// Identifier unique within the owning machine.
    fn id(&self) -> u32;

    /// Invoked after the machine takes ownership of the state.
    fn on_enter(&mut self, _ctx: &mut C) {}

    /// Invoked when the state is left. For composite states the engine stops
    /// the nested machine first, so every active descendant has already run
    /// its own exit hook by the time this one is called.
    fn on_exit(&mut self, _ctx: &mut C) {}

    /// Handle an event routed to this state. Composite states typically
    /// forward events they do not handle into their nested machine.
    fn on_event(&mut self, ctx: &mut C, event: &Event) -> bool;

    /// Nested machine of a composite state; leaves return `None`.
    fn machine(&self) -> Option<&StateMachine<C>> {
        None
    }

    fn machine_mut(&mut self) -> Option<&mut StateMachine<C>> {
        None
    }

    /// Deepest active state id in this branch. Bottoms out at a true leaf.
    fn current_state_id(&self) -> u32 {
        match self.machine() {
            Some(nested) => match nested.current_state_id() {
                STATE_ID_INVALID => self.id(),
                deeper => deeper,
            },
            None => self.id(),
        }
    }
}

enum Request<C> {
    Transition(Option<Box<dyn State<C>>>),
    Stop,
}

type Mailbox<C> = RefCell<VecDeque<Request<C>>>;

/// Non-owning handle a state uses to ask the machine that owns it for a
/// transition. A state cannot mutate its own position directly; it enqueues
/// a request that the machine applies once the current hook returns. When
/// the owning machine is gone the request is dropped.
pub struct ParentLink<C> {
    mailbox: Weak<Mailbox<C>>,
}

impl<C> Clone for ParentLink<C> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<C> fmt::Debug for ParentLink<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentLink")
            .field("resolved", &(self.mailbox.strong_count() > 0))
            .finish()
    }
}

impl<C> ParentLink<C> {
    /// Request a transition to `next`. Returns `false` when the owning
    /// machine no longer exists.
    pub fn change_state(&self, next: Box<dyn State<C>>) -> bool {
        self.request(Request::Transition(Some(next)))
    }

    /// Request that the owning machine clear its active state.
    pub fn wind_down(&self) -> bool {
        self.request(Request::Transition(None))
    }

    /// Request that the owning machine stop.
    pub fn stop(&self) -> bool {
        self.request(Request::Stop)
    }

    fn request(&self, request: Request<C>) -> bool {
        match self.mailbox.upgrade() {
            Some(mailbox) => {
                mailbox.borrow_mut().push_back(request);
                true
            }
            None => {
                debug!("transition requested on a machine that no longer exists");
                false
            }
        }
    }
}

/// Generic state-machine engine. Owns at most one current state, exposes a
/// start/stop lifecycle and a transition operation with fixed exit/entry
/// ordering. Every failure is a logged rejected transition, never an error.
///
/// Event delivery is assumed to be externally serialized: the engine takes
/// no locks around `current` mutation, and there is no ordering guarantee
/// between a timer expiry that comes due during a paced hook and an event
/// injected by the caller in the same window.
pub struct StateMachine<C> {
    name: &'static str,
    started: bool,
    current: Option<Box<dyn State<C>>>,
    mailbox: Rc<Mailbox<C>>,
}

impl<C> StateMachine<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            started: false,
            current: None,
            mailbox: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Marks the machine runnable. Choosing an initial state is the concrete
    /// machine's job.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Exits the active state (cascading through nested machines) and clears
    /// it, along with any queued requests. Safe to call when already stopped.
    pub fn stop(&mut self, ctx: &mut C) {
        if let Some(state) = self.current.take() {
            debug!(machine = self.name, state = state.name(), "exit");
            Self::retire(state, ctx);
        }
        self.started = false;
        self.mailbox.borrow_mut().clear();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Handle to give to states owned by this machine.
    pub fn link(&self) -> ParentLink<C> {
        ParentLink {
            mailbox: Rc::downgrade(&self.mailbox),
        }
    }

    /// Performs a transition. Rejected when the machine is stopped; a no-op
    /// when `next` carries the current state's id (or both are absent).
    /// `None` is legal and models "no active state".
    pub fn change_state(&mut self, next: Option<Box<dyn State<C>>>, ctx: &mut C) {
        if !self.started {
            warn!(machine = self.name, "state change rejected: machine not started");
            return;
        }

        let redundant = match (&self.current, &next) {
            (Some(current), Some(requested)) => current.id() == requested.id(),
            (None, None) => true,
            _ => false,
        };
        if redundant {
            debug!(
                machine = self.name,
                "state change ignored: already in requested state"
            );
            return;
        }

        if let Some(previous) = self.current.take() {
            debug!(machine = self.name, state = previous.name(), "exit");
            Self::retire(previous, ctx);
        }

        self.current = next;
        if let Some(state) = self.current.as_mut() {
            debug!(machine = self.name, state = state.name(), "enter");
            state.on_enter(ctx);
        }
    }

    /// Applies one queued transition request. Returns whether one was applied.
    pub fn pump(&mut self, ctx: &mut C) -> bool {
        let request = self.mailbox.borrow_mut().pop_front();
        match request {
            Some(Request::Transition(next)) => {
                self.change_state(next, ctx);
                true
            }
            Some(Request::Stop) => {
                self.stop(ctx);
                true
            }
            None => false,
        }
    }

    /// Applies queued transition requests until none remain.
    pub fn settle(&mut self, ctx: &mut C) {
        while self.pump(ctx) {}
    }

    pub fn has_pending(&self) -> bool {
        !self.mailbox.borrow().is_empty()
    }

    /// Default dispatch path: delegate to the current state. Returns `false`
    /// when there is no state to deliver to.
    pub fn on_event(&mut self, ctx: &mut C, event: &Event) -> bool {
        match self.current.as_mut() {
            Some(state) => state.on_event(ctx, event),
            None => false,
        }
    }

    /// `STATE_ID_INVALID` when nothing is active, otherwise the deepest
    /// active state id across nested machines.
    pub fn current_state_id(&self) -> u32 {
        self.current
            .as_ref()
            .map_or(STATE_ID_INVALID, |state| state.current_state_id())
    }

    /// Renders the chain of active states, deepest last. Diagnostics only.
    pub fn active_chain(&self) -> String {
        let mut out = String::from(self.name);
        let mut node: Option<&dyn State<C>> = self.current.as_deref();
        while let Some(state) = node {
            out.push('/');
            out.push_str(state.name());
            node = state.machine().and_then(|nested| nested.current.as_deref());
        }
        out
    }

    // Descendants leave before the state's own exit hook runs.
    fn retire(mut state: Box<dyn State<C>>, ctx: &mut C) {
        if let Some(nested) = state.machine_mut() {
            nested.stop(ctx);
        }
        state.on_exit(ctx);
    }
}

impl<C> fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("started", &self.started)
            .field("current", &self.current.as_ref().map(|state| state.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[derive(Default)]
    struct TestCtx {
        log: Vec<String>,
    }

    struct Leaf {
        name: &'static str,
        id: u32,
    }

    impl State<TestCtx> for Leaf {
        fn name(&self) -> &'static str {
            self.name
        }

        fn id(&self) -> u32 {
            self.id
        }

        fn on_enter(&mut self, ctx: &mut TestCtx) {
            ctx.log.push(format!("enter:{}", self.name));
        }

        fn on_exit(&mut self, ctx: &mut TestCtx) {
            ctx.log.push(format!("exit:{}", self.name));
        }

        fn on_event(&mut self, ctx: &mut TestCtx, event: &Event) -> bool {
            ctx.log.push(format!("event:{}:{}", self.name, event.name));
            true
        }
    }

    // Requests a follow-up transition from inside its entry hook.
    struct Chaining {
        id: u32,
        next_id: u32,
        link: ParentLink<TestCtx>,
    }

    impl State<TestCtx> for Chaining {
        fn name(&self) -> &'static str {
            "Chaining"
        }

        fn id(&self) -> u32 {
            self.id
        }

        fn on_enter(&mut self, ctx: &mut TestCtx) {
            ctx.log.push("enter:Chaining".to_string());
            self.link.change_state(Box::new(Leaf {
                name: "Next",
                id: self.next_id,
            }));
        }

        fn on_event(&mut self, _ctx: &mut TestCtx, _event: &Event) -> bool {
            true
        }
    }

    // Composite state owning a nested machine with one leaf.
    struct Branch {
        nested: StateMachine<TestCtx>,
    }

    impl Branch {
        fn new() -> Self {
            Self {
                nested: StateMachine::new("branch"),
            }
        }
    }

    impl State<TestCtx> for Branch {
        fn name(&self) -> &'static str {
            "Branch"
        }

        fn id(&self) -> u32 {
            10
        }

        fn on_enter(&mut self, ctx: &mut TestCtx) {
            ctx.log.push("enter:Branch".to_string());
            self.nested.start();
            self.nested
                .change_state(Some(Box::new(Leaf { name: "Inner", id: 11 })), ctx);
        }

        fn on_exit(&mut self, ctx: &mut TestCtx) {
            ctx.log.push("exit:Branch".to_string());
        }

        fn on_event(&mut self, ctx: &mut TestCtx, event: &Event) -> bool {
            self.nested.on_event(ctx, event)
        }

        fn machine(&self) -> Option<&StateMachine<TestCtx>> {
            Some(&self.nested)
        }

        fn machine_mut(&mut self) -> Option<&mut StateMachine<TestCtx>> {
            Some(&mut self.nested)
        }
    }

    #[test]
    fn test_invalid_id_before_start() {
        let machine: StateMachine<TestCtx> = StateMachine::new("test");
        assert_eq!(machine.current_state_id(), STATE_ID_INVALID);
        assert!(!machine.is_started());
    }

    #[test]
    fn test_change_rejected_when_stopped() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");

        machine.change_state(Some(Box::new(Leaf { name: "A", id: 1 })), &mut ctx);

        assert_eq!(machine.current_state_id(), STATE_ID_INVALID);
        assert!(ctx.log.is_empty());
    }

    #[test]
    fn test_exit_before_enter_ordering() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();

        machine.change_state(Some(Box::new(Leaf { name: "A", id: 1 })), &mut ctx);
        machine.change_state(Some(Box::new(Leaf { name: "B", id: 2 })), &mut ctx);

        assert_eq!(ctx.log, vec!["enter:A", "exit:A", "enter:B"]);
        assert_eq!(machine.current_state_id(), 2);
    }

    #[test]
    fn test_same_id_transition_is_noop() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();

        machine.change_state(Some(Box::new(Leaf { name: "A", id: 1 })), &mut ctx);
        machine.change_state(Some(Box::new(Leaf { name: "A2", id: 1 })), &mut ctx);

        assert_eq!(ctx.log, vec!["enter:A"]);
        assert_eq!(machine.current_state_id(), 1);
    }

    #[test]
    fn test_wind_down_clears_state() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();

        machine.change_state(Some(Box::new(Leaf { name: "A", id: 1 })), &mut ctx);
        machine.change_state(None, &mut ctx);

        assert_eq!(ctx.log, vec!["enter:A", "exit:A"]);
        assert_eq!(machine.current_state_id(), STATE_ID_INVALID);
        assert!(machine.is_started());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut ctx = TestCtx::default();
        let mut machine: StateMachine<TestCtx> = StateMachine::new("test");
        machine.stop(&mut ctx);
        machine.stop(&mut ctx);
        assert!(ctx.log.is_empty());
    }

    #[test]
    fn test_composite_reports_deepest_id() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();

        machine.change_state(Some(Box::new(Branch::new())), &mut ctx);

        assert_eq!(machine.current_state_id(), 11);
        assert_eq!(machine.active_chain(), "test/Branch/Inner");
    }

    #[test]
    fn test_stop_cascades_through_descendants() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();

        machine.change_state(Some(Box::new(Branch::new())), &mut ctx);
        machine.stop(&mut ctx);

        assert_eq!(
            ctx.log,
            vec!["enter:Branch", "enter:Inner", "exit:Inner", "exit:Branch"]
        );
        assert_eq!(machine.current_state_id(), STATE_ID_INVALID);
        assert!(!machine.is_started());
    }

    #[test]
    fn test_change_sub_state_increases_depth() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();
        machine.change_state(Some(Box::new(Branch::new())), &mut ctx);

        let nested = machine
            .current
            .as_mut()
            .and_then(|state| state.machine_mut())
            .expect("branch owns a nested machine");
        nested.change_state(Some(Box::new(Leaf { name: "Other", id: 12 })), &mut ctx);

        assert_eq!(machine.current_state_id(), 12);
    }

    #[test]
    fn test_event_routed_into_nested_machine() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();
        machine.change_state(Some(Box::new(Branch::new())), &mut ctx);

        let event = Event::new(1, "ping", 0);
        assert!(machine.on_event(&mut ctx, &event));
        assert!(ctx.log.contains(&"event:Inner:ping".to_string()));
    }

    #[test]
    fn test_on_event_without_state() {
        let mut ctx = TestCtx::default();
        let mut machine: StateMachine<TestCtx> = StateMachine::new("test");
        machine.start();

        let event = Event::new(1, "ping", 0);
        assert!(!machine.on_event(&mut ctx, &event));
    }

    #[test]
    fn test_mailbox_request_applied_on_pump() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();
        let link = machine.link();

        machine.change_state(
            Some(Box::new(Chaining {
                id: 1,
                next_id: 2,
                link,
            })),
            &mut ctx,
        );

        assert_eq!(machine.current_state_id(), 1);
        assert!(machine.has_pending());
        assert!(machine.pump(&mut ctx));
        assert_eq!(machine.current_state_id(), 2);
        assert!(!machine.pump(&mut ctx));
    }

    #[test]
    fn test_dead_parent_link_drops_request() {
        let link = {
            let machine: StateMachine<TestCtx> = StateMachine::new("test");
            machine.link()
        };

        assert!(!link.change_state(Box::new(Leaf { name: "A", id: 1 })));
        assert!(!link.stop());
    }

    #[test]
    fn test_stop_request_via_link() {
        let mut ctx = TestCtx::default();
        let mut machine = StateMachine::new("test");
        machine.start();
        let link = machine.link();

        machine.change_state(Some(Box::new(Leaf { name: "A", id: 1 })), &mut ctx);
        link.stop();
        machine.settle(&mut ctx);

        assert!(!machine.is_started());
        assert_eq!(machine.current_state_id(), STATE_ID_INVALID);
    }
}
