//! Generic finite state machine engine.
//!
//! The engine serializes asynchronous events (hardware notifications, timer
//! expiries, user commands) into a single-threaded control sequence:
//!
//! - States and events are registered by name and referred to by small copyable
//!   tokens ([`StateId`], [`EventId`]).
//! - A transition maps `(state, event)` to an [`Action`] plus an ordered list of
//!   candidate destination states. The action's [`Branch`] return value selects
//!   the destination by ordinal, so one action can encode several outcomes
//!   (success/failure, more images/acquisition complete, ...).
//! - Events with no transition registered for the current state are discarded.
//!   Irrelevant events in the wrong state must never fault the machine.
//! - Actions receive a [`Control`] handle to arm or cancel single-shot timers,
//!   post follow-up events, or discard the queue (used by reboot).
//!
//! Exactly one transition executes at a time. Events posted while a transition
//! is running are queued behind it, never dropped, unless an action explicitly
//! calls [`Control::clear`].
//!
//! # Example
//!
//! ```
//! use pco_daq::state_machine::{Branch, Control, StateMachine};
//!
//! struct Door { locked: bool }
//!
//! fn open(door: &mut Door, _ctl: &mut Control<'_>) -> Branch {
//!     if door.locked { Branch::Second } else { Branch::First }
//! }
//!
//! let mut builder = StateMachine::builder("door");
//! let closed = builder.state("Closed");
//! let opened = builder.state("Open");
//! let push = builder.event("Push");
//! builder.transition(closed, push, open, &[opened, closed]);
//! builder.initial_state(closed);
//!
//! let mut machine = builder.build(Door { locked: false }, 8);
//! machine.poster().post(push).unwrap();
//! machine.process_all();
//! assert!(machine.is_state(opened));
//! ```

pub mod queue;
pub mod timer;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::error::{AppResult, DriverError};
use queue::{EventQueue, PostRejected, Wait};
pub use timer::TimerId;
use timer::TimerBank;

/// Token for a registered state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(pub(crate) usize);

/// Token for a registered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) usize);

/// Ordinal selecting one of a transition's registered destination states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Destination 0, conventionally success.
    First,
    /// Destination 1.
    Second,
    /// Destination 2.
    Third,
    /// Destination 3.
    Fourth,
}

impl Branch {
    /// Position in the destination list.
    pub fn index(self) -> usize {
        match self {
            Branch::First => 0,
            Branch::Second => 1,
            Branch::Third => 2,
            Branch::Fourth => 3,
        }
    }
}

/// Transition action: runs on the machine thread, reports its outcome as a branch.
pub type Action<C> = fn(&mut C, &mut Control<'_>) -> Branch;

struct Transition<C> {
    action: Action<C>,
    destinations: Vec<StateId>,
}

/// Outcome of processing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRecord {
    /// State the event arrived in.
    pub from: StateId,
    /// The handled event.
    pub event: EventId,
    /// `None` when the event was ignored, or the action returned an ordinal
    /// with no registered destination.
    pub to: Option<StateId>,
}

/// A completed transition, by name. Handed to the observer.
#[derive(Debug, Clone, Copy)]
pub struct StateChange<'a> {
    /// Source state name.
    pub from: &'a str,
    /// Event name.
    pub event: &'a str,
    /// Destination state name.
    pub to: &'a str,
}

impl fmt::Display for StateChange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} --{}--> {}", self.from, self.event, self.to)
    }
}

type Observer = Box<dyn FnMut(&StateChange<'_>) + Send>;

/// Capabilities handed to an action while it runs.
pub struct Control<'a> {
    timers: &'a mut TimerBank,
    queue: &'a EventQueue,
    now: Instant,
}

impl Control<'_> {
    /// Arm the machine's default timer, replacing any pending expiry.
    pub fn start_timer(&mut self, period: Duration, event: EventId) {
        self.timers.start(TimerId::DEFAULT, self.now, period, event);
    }

    /// Cancel the default timer.
    pub fn stop_timer(&mut self) {
        self.timers.stop(TimerId::DEFAULT);
    }

    /// Arm an extra timer registered with [`StateMachine::timer`].
    pub fn start(&mut self, timer: TimerId, period: Duration, event: EventId) {
        self.timers.start(timer, self.now, period, event);
    }

    /// Cancel an extra timer.
    pub fn stop(&mut self, timer: TimerId) {
        self.timers.stop(timer);
    }

    /// Cancel every timer of the machine.
    pub fn stop_all_timers(&mut self) {
        self.timers.stop_all();
    }

    /// Queue an event behind everything already pending.
    pub fn post(&mut self, event: EventId) -> bool {
        match self.queue.push(event) {
            Ok(()) => true,
            Err(reason) => {
                warn!(?event, ?reason, "event posted from action was rejected");
                false
            }
        }
    }

    /// Discard every queued event. Returns the number dropped.
    pub fn clear(&mut self) -> usize {
        self.queue.clear()
    }
}

/// Cloneable, thread-safe handle for posting events to a machine.
#[derive(Clone)]
pub struct EventPoster {
    queue: Arc<EventQueue>,
    names: Arc<[String]>,
}

impl EventPoster {
    /// Enqueue an event. Never blocks; a full queue rejects the event.
    pub fn post(&self, event: EventId) -> AppResult<()> {
        match self.queue.push(event) {
            Ok(()) => Ok(()),
            Err(PostRejected::Full) => {
                let name = self.event_name(event);
                warn!(
                    event = %name,
                    capacity = self.queue.capacity(),
                    "event queue full, event dropped"
                );
                Err(DriverError::QueueFull {
                    event: name,
                    capacity: self.queue.capacity(),
                })
            }
            Err(PostRejected::Closed) => Err(DriverError::QueueClosed),
        }
    }

    /// Stop the machine's run loop once the already queued events are handled.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Events waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn event_name(&self, event: EventId) -> String {
        self.names
            .get(event.0)
            .cloned()
            .unwrap_or_else(|| format!("#{}", event.0))
    }
}

/// Registers the states, events, timers and transitions of a machine before
/// the context exists. The first registered state is the initial state unless
/// [`initial_state`](Self::initial_state) says otherwise.
pub struct Builder<C> {
    name: String,
    states: Vec<String>,
    events: Vec<String>,
    transitions: HashMap<(StateId, EventId), Transition<C>>,
    timers: TimerBank,
    initial: StateId,
}

impl<C> Builder<C> {
    /// Register a state.
    pub fn state(&mut self, name: impl Into<String>) -> StateId {
        self.states.push(name.into());
        StateId(self.states.len() - 1)
    }

    /// Register an event.
    pub fn event(&mut self, name: impl Into<String>) -> EventId {
        self.events.push(name.into());
        EventId(self.events.len() - 1)
    }

    /// Register an extra single-shot timer.
    pub fn timer(&mut self) -> TimerId {
        self.timers.add()
    }

    /// Register `(from, event) -> action` with its candidate destinations.
    /// Registering the same pair again replaces the earlier rule.
    pub fn transition(
        &mut self,
        from: StateId,
        event: EventId,
        action: Action<C>,
        destinations: &[StateId],
    ) {
        debug_assert!(
            (1..=4).contains(&destinations.len()),
            "a transition needs 1 to 4 destinations"
        );
        self.transitions.insert(
            (from, event),
            Transition {
                action,
                destinations: destinations.to_vec(),
            },
        );
    }

    /// State the machine starts in.
    pub fn initial_state(&mut self, state: StateId) {
        self.initial = state;
    }

    /// Hand the machine its context, with an event queue of `queue_capacity`
    /// entries.
    pub fn build(self, context: C, queue_capacity: usize) -> StateMachine<C> {
        StateMachine {
            name: self.name,
            context,
            states: self.states,
            events: self.events,
            transitions: self.transitions,
            current: self.initial,
            queue: EventQueue::new(queue_capacity.max(1)),
            timers: self.timers,
            last: None,
            observer: None,
        }
    }
}

/// A built machine: its context, transition table, event queue and timers.
pub struct StateMachine<C> {
    name: String,
    context: C,
    states: Vec<String>,
    events: Vec<String>,
    transitions: HashMap<(StateId, EventId), Transition<C>>,
    current: StateId,
    queue: Arc<EventQueue>,
    timers: TimerBank,
    last: Option<TransitionRecord>,
    observer: Option<Observer>,
}

impl<C> StateMachine<C> {
    /// Start registering a machine named `name` (used in log fields).
    pub fn builder(name: impl Into<String>) -> Builder<C> {
        Builder {
            name: name.into(),
            states: Vec::new(),
            events: Vec::new(),
            transitions: HashMap::new(),
            timers: TimerBank::new(),
            initial: StateId(0),
        }
    }

    /// Called after every executed transition, on the machine thread.
    pub fn set_observer(&mut self, observer: impl FnMut(&StateChange<'_>) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Handle for posting events from any thread.
    pub fn poster(&self) -> EventPoster {
        EventPoster {
            queue: Arc::clone(&self.queue),
            names: self.events.clone().into(),
        }
    }

    /// State the machine is in.
    pub fn current_state(&self) -> StateId {
        self.current
    }

    /// Whether the machine is in `state`.
    pub fn is_state(&self, state: StateId) -> bool {
        self.current == state
    }

    /// Registered name of a state.
    pub fn state_name(&self, state: StateId) -> &str {
        self.states.get(state.0).map(String::as_str).unwrap_or("?")
    }

    /// Registered name of an event.
    pub fn event_name(&self, event: EventId) -> &str {
        self.events.get(event.0).map(String::as_str).unwrap_or("?")
    }

    /// Outcome of the most recent dispatched event.
    pub fn last_record(&self) -> Option<TransitionRecord> {
        self.last
    }

    /// Events waiting in the queue.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Whether `timer` has an armed expiry.
    pub fn is_timer_pending(&self, timer: TimerId) -> bool {
        self.timers.is_pending(timer)
    }

    /// The machine's context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Mutable access to the context between events.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Process a single queued event, if any.
    pub fn process(&mut self) -> Option<TransitionRecord> {
        let event = self.queue.try_pop()?;
        Some(self.dispatch(event))
    }

    /// Process events until the queue is empty. Returns how many were handled.
    pub fn process_all(&mut self) -> usize {
        let mut handled = 0;
        while self.process().is_some() {
            handled += 1;
        }
        handled
    }

    /// Post the events of every timer due at `now`. Returns how many were
    /// queued. An expiry that finds the queue full stays armed and is posted
    /// again on the next call.
    pub fn fire_due_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for (timer, pending) in self.timers.take_due(now) {
            let event = pending.event;
            trace!(machine = %self.name, event = self.event_name(event), "timer expired");
            match self.queue.push(event) {
                Ok(()) => fired += 1,
                Err(PostRejected::Full) => {
                    debug!(
                        machine = %self.name,
                        event = self.event_name(event),
                        "event queue full, timer expiry deferred"
                    );
                    self.timers.restore(timer, pending);
                }
                Err(PostRejected::Closed) => {
                    warn!(
                        machine = %self.name,
                        event = self.event_name(event),
                        "timer expired after the queue was closed"
                    );
                }
            }
        }
        fired
    }

    /// Drive the machine on the calling thread until the queue is closed.
    /// Returns the context once the last queued event has been handled.
    pub fn run(mut self) -> C {
        info!(machine = %self.name, state = self.state_name(self.current), "state machine running");
        loop {
            self.fire_due_timers(Instant::now());
            match self.queue.wait_pop(self.timers.next_deadline()) {
                Wait::Event(event) => {
                    self.dispatch(event);
                }
                Wait::Timeout => {}
                Wait::Closed => break,
            }
        }
        info!(machine = %self.name, "state machine stopped");
        self.context
    }

    fn dispatch(&mut self, event: EventId) -> TransitionRecord {
        let from = self.current;
        let (action, destinations) = match self.transitions.get(&(from, event)) {
            Some(t) => (t.action, t.destinations.clone()),
            None => {
                debug!(
                    machine = %self.name,
                    state = self.state_name(from),
                    event = self.event_name(event),
                    "no transition, event ignored"
                );
                let record = TransitionRecord {
                    from,
                    event,
                    to: None,
                };
                self.last = Some(record);
                return record;
            }
        };

        let mut control = Control {
            timers: &mut self.timers,
            queue: &self.queue,
            now: Instant::now(),
        };
        let branch = action(&mut self.context, &mut control);

        let to = destinations.get(branch.index()).copied();
        match to {
            Some(to) => {
                self.current = to;
                let change = StateChange {
                    from: self.states.get(from.0).map(String::as_str).unwrap_or("?"),
                    event: self.events.get(event.0).map(String::as_str).unwrap_or("?"),
                    to: self.states.get(to.0).map(String::as_str).unwrap_or("?"),
                };
                debug!(machine = %self.name, transition = %change, "transition");
                if let Some(observer) = self.observer.as_mut() {
                    observer(&change);
                }
            }
            None => {
                error!(
                    machine = %self.name,
                    state = self.state_name(from),
                    event = self.event_name(event),
                    ?branch,
                    registered = destinations.len(),
                    "action selected an unregistered destination, state unchanged"
                );
            }
        }

        let record = TransitionRecord { from, event, to };
        self.last = Some(record);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Script {
        /// Branches to return, consumed front to back.
        outcomes: Vec<Branch>,
        calls: Vec<&'static str>,
        tick: Option<EventId>,
    }

    fn scripted(s: &mut Script, _ctl: &mut Control<'_>) -> Branch {
        s.calls.push("scripted");
        if s.outcomes.is_empty() {
            Branch::First
        } else {
            s.outcomes.remove(0)
        }
    }

    fn arm_tick(s: &mut Script, ctl: &mut Control<'_>) -> Branch {
        s.calls.push("arm_tick");
        if let Some(tick) = s.tick {
            ctl.start_timer(Duration::from_secs(60), tick);
        }
        Branch::First
    }

    fn flush(s: &mut Script, ctl: &mut Control<'_>) -> Branch {
        s.calls.push("flush");
        ctl.clear();
        Branch::First
    }

    fn repost(s: &mut Script, ctl: &mut Control<'_>) -> Branch {
        s.calls.push("repost");
        if let Some(tick) = s.tick {
            ctl.post(tick);
        }
        Branch::First
    }

    /// States A, B, C and events Go, Back, Tick, plus any extra rules.
    fn machine_with(
        extra: impl FnOnce(&mut Builder<Script>, [StateId; 3], [EventId; 3]),
    ) -> (StateMachine<Script>, [StateId; 3], [EventId; 3]) {
        let mut builder = StateMachine::builder("test");
        let a = builder.state("A");
        let b = builder.state("B");
        let c = builder.state("C");
        let go = builder.event("Go");
        let back = builder.event("Back");
        let tick = builder.event("Tick");
        builder.transition(a, go, scripted, &[b, c]);
        builder.transition(b, back, scripted, &[a]);
        builder.transition(c, back, scripted, &[a]);
        builder.initial_state(a);
        extra(&mut builder, [a, b, c], [go, back, tick]);

        let script = Script {
            tick: Some(tick),
            ..Script::default()
        };
        (builder.build(script, 8), [a, b, c], [go, back, tick])
    }

    fn machine() -> (StateMachine<Script>, [StateId; 3], [EventId; 3]) {
        machine_with(|_, _, _| {})
    }

    #[test]
    fn branch_selects_destination() {
        let (mut m, [a, b, c], [go, back, _]) = machine();
        m.context_mut().outcomes = vec![Branch::Second, Branch::First, Branch::First];
        let poster = m.poster();

        poster.post(go).unwrap();
        m.process();
        assert!(m.is_state(c));

        poster.post(back).unwrap();
        poster.post(go).unwrap();
        m.process_all();
        assert!(m.is_state(b));
        assert_eq!(m.state_name(a), "A");
    }

    #[test]
    fn events_processed_in_post_order() {
        let (mut m, [a, b, _], [go, back, _]) = machine();
        let poster = m.poster();
        // Back is irrelevant in A and must be skipped before Go moves to B.
        poster.post(back).unwrap();
        poster.post(go).unwrap();
        poster.post(back).unwrap();

        let first = m.process().unwrap();
        assert_eq!(first.to, None);
        assert!(m.is_state(a));
        m.process_all();
        assert!(m.is_state(a));
        assert_eq!(m.context().calls, vec!["scripted", "scripted"]);
        let _ = b;
    }

    #[test]
    fn unknown_pair_leaves_state_and_queue_alone() {
        let (mut m, [a, _, _], [go, back, _]) = machine();
        let poster = m.poster();
        poster.post(back).unwrap();
        poster.post(go).unwrap();

        let record = m.process().unwrap();
        assert_eq!(record.from, a);
        assert_eq!(record.to, None);
        assert!(m.is_state(a));
        assert_eq!(m.pending_events(), 1);
        assert!(m.context().calls.is_empty());
    }

    #[test]
    fn unregistered_ordinal_keeps_state() {
        let (mut m, [a, _, _], [go, _, _]) = machine();
        m.context_mut().outcomes = vec![Branch::Fourth];
        m.poster().post(go).unwrap();
        let record = m.process().unwrap();
        assert_eq!(record.to, None);
        assert!(m.is_state(a));
    }

    #[test]
    fn action_timer_posts_event_on_expiry() {
        let (mut m, [a, _, _], [go, _, _]) = machine_with(|builder, [a, b, _], [go, _, tick]| {
            builder.transition(a, go, arm_tick, &[b]);
            builder.transition(b, tick, scripted, &[a]);
        });

        m.poster().post(go).unwrap();
        m.process();
        assert!(m.is_timer_pending(TimerId::DEFAULT));
        assert_eq!(m.fire_due_timers(Instant::now()), 0);

        assert_eq!(m.fire_due_timers(Instant::now() + Duration::from_secs(120)), 1);
        m.process_all();
        assert!(m.is_state(a));
        assert!(!m.is_timer_pending(TimerId::DEFAULT));
    }

    #[test]
    fn timer_expiry_waits_for_room_in_a_full_queue() {
        let mut builder = StateMachine::builder("tight");
        let a = builder.state("A");
        let b = builder.state("B");
        let go = builder.event("Go");
        let tick = builder.event("Tick");
        builder.transition(a, go, arm_tick, &[a]);
        builder.transition(a, tick, scripted, &[b]);
        let script = Script {
            tick: Some(tick),
            ..Script::default()
        };
        let mut m = builder.build(script, 1);
        let poster = m.poster();

        poster.post(go).unwrap();
        m.process();
        poster.post(go).unwrap();
        let late = Instant::now() + Duration::from_secs(120);
        assert_eq!(m.fire_due_timers(late), 0);
        assert!(m.is_timer_pending(TimerId::DEFAULT));

        // Go re-arms the timer with a fresh deadline that replaces the deferred one
        m.process();
        assert_eq!(m.fire_due_timers(late), 1);
        m.process();
        assert!(m.is_state(b));
        assert!(!m.is_timer_pending(TimerId::DEFAULT));
    }

    #[test]
    fn deferred_expiry_fires_once_the_queue_drains() {
        let mut builder = StateMachine::builder("tight");
        let a = builder.state("A");
        let b = builder.state("B");
        let go = builder.event("Go");
        let back = builder.event("Back");
        let tick = builder.event("Tick");
        builder.transition(a, go, arm_tick, &[a]);
        builder.transition(a, tick, scripted, &[b]);
        let script = Script {
            tick: Some(tick),
            ..Script::default()
        };
        let mut m = builder.build(script, 1);
        let poster = m.poster();

        poster.post(go).unwrap();
        m.process();
        // Back is ignored in A but occupies the only slot
        poster.post(back).unwrap();
        let late = Instant::now() + Duration::from_secs(120);
        assert_eq!(m.fire_due_timers(late), 0);

        m.process();
        assert_eq!(m.fire_due_timers(late), 1);
        m.process();
        assert!(m.is_state(b));
    }

    #[test]
    fn events_posted_during_action_are_deferred() {
        let (mut m, [a, b, _], [go, _, _]) = machine_with(|builder, [a, b, _], [go, _, tick]| {
            builder.transition(a, go, repost, &[b]);
            builder.transition(b, tick, scripted, &[a]);
        });

        m.poster().post(go).unwrap();
        m.process();
        assert!(m.is_state(b));
        assert_eq!(m.pending_events(), 1);
        m.process();
        assert!(m.is_state(a));
    }

    #[test]
    fn clear_discards_queued_events() {
        let (mut m, [_, b, _], [go, back, tick]) = machine_with(|builder, [a, b, _], [go, _, _]| {
            builder.transition(a, go, flush, &[b]);
        });
        let poster = m.poster();
        poster.post(go).unwrap();
        poster.post(tick).unwrap();
        poster.post(back).unwrap();

        m.process();
        assert_eq!(m.pending_events(), 0);
        assert!(m.is_state(b));
    }

    #[test]
    #[traced_test]
    fn ignored_and_misrouted_events_are_logged() {
        let (mut m, _, [go, back, _]) = machine();
        m.context_mut().outcomes = vec![Branch::Third];
        let poster = m.poster();
        poster.post(back).unwrap();
        poster.post(go).unwrap();
        m.process_all();

        assert!(logs_contain("no transition, event ignored"));
        assert!(logs_contain("action selected an unregistered destination"));
    }

    #[test]
    fn full_queue_rejects_post() {
        let mut builder = StateMachine::builder("small");
        let a = builder.state("A");
        let go = builder.event("Go");
        builder.initial_state(a);
        let m = builder.build(Script::default(), 2);
        let poster = m.poster();
        poster.post(go).unwrap();
        poster.post(go).unwrap();
        let err = poster.post(go).unwrap_err();
        assert!(matches!(err, DriverError::QueueFull { ref event, capacity: 2 } if event == "Go"));
    }

    #[test]
    fn observer_sees_named_transitions() {
        let (mut m, _, [go, _, _]) = machine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        m.set_observer(move |change| sink.lock().unwrap().push(change.to_string()));

        m.poster().post(go).unwrap();
        m.process();
        assert_eq!(*seen.lock().unwrap(), vec!["A --Go--> B".to_string()]);
    }

    #[test]
    fn run_drains_queue_then_returns_context_on_close() {
        let (m, _, [go, back, _]) = machine();
        let poster = m.poster();
        let handle = std::thread::spawn(move || m.run());

        poster.post(go).unwrap();
        poster.post(back).unwrap();
        poster.close();

        let context = handle.join().unwrap();
        assert_eq!(context.calls, vec!["scripted", "scripted"]);
    }
}
