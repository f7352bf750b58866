//! State Machine Runtime (C4): a generic interpreter for finite state
//! machines (§4.4). Generalizes `durable::engine::registry::AnyWorkflow`'s
//! type erasure — instead of one hand-written `Workflow` impl per state
//! machine, a `StateMachineDefinition<C>` is built declaratively (states,
//! transition table, guards, actions) and driven by one `Interpreter<C>`
//! shared by C5/C6/C7/C8.
//!
//! The interpreter itself is synchronous and single-threaded per instance,
//! matching "single-threaded cooperative per interpreter" (§5). Entry
//! actions here only mutate context; the asynchronous operator calls an
//! entry commonly triggers (persistence writes, nested engine calls, human
//! gates) are the owning engine's responsibility — it awaits them in its
//! own run loop and feeds the resulting event back in via `send`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

pub type Guard<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;
pub type Action<C> = Arc<dyn Fn(&mut C) + Send + Sync>;
pub type EntryAction<C> = Arc<dyn Fn(&mut C) + Send + Sync>;
pub type TransitionObserver<C> = Arc<dyn Fn(&str, &str, &str, &C) + Send + Sync>;
pub type DoneObserver<C> = Arc<dyn Fn(&C) + Send + Sync>;
pub type StopObserver<C> = Arc<dyn Fn(&C) + Send + Sync>;

pub struct Transition<C> {
    pub event: String,
    pub target: String,
    pub guard: Option<Guard<C>>,
    pub action: Option<Action<C>>,
}

pub struct StateMachineDefinition<C> {
    initial: String,
    states: HashSet<String>,
    finals: HashSet<String>,
    transitions: HashMap<String, Vec<Transition<C>>>,
    entry_actions: HashMap<String, EntryAction<C>>,
}

pub struct StateMachineBuilder<C> {
    initial: Option<String>,
    states: HashSet<String>,
    finals: HashSet<String>,
    transitions: HashMap<String, Vec<Transition<C>>>,
    entry_actions: HashMap<String, EntryAction<C>>,
}

impl<C> Default for StateMachineBuilder<C> {
    fn default() -> Self {
        Self {
            initial: None,
            states: HashSet::new(),
            finals: HashSet::new(),
            transitions: HashMap::new(),
            entry_actions: HashMap::new(),
        }
    }
}

impl<C> StateMachineBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.states.insert(state.clone());
        self.initial = Some(state);
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.states.insert(state.into());
        self
    }

    pub fn final_state(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.states.insert(state.clone());
        self.finals.insert(state);
        self
    }

    pub fn entry(mut self, state: impl Into<String>, action: EntryAction<C>) -> Self {
        self.entry_actions.insert(state.into(), action);
        self
    }

    pub fn transition(
        mut self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        let from = from.into();
        let to = to.into();
        self.states.insert(from.clone());
        self.states.insert(to.clone());
        self.transitions.entry(from).or_default().push(Transition {
            event: event.into(),
            target: to,
            guard: None,
            action: None,
        });
        self
    }

    pub fn guarded_transition(
        mut self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
        guard: Guard<C>,
    ) -> Self {
        let from = from.into();
        let to = to.into();
        self.states.insert(from.clone());
        self.states.insert(to.clone());
        self.transitions.entry(from).or_default().push(Transition {
            event: event.into(),
            target: to,
            guard: Some(guard),
            action: None,
        });
        self
    }

    pub fn transition_with_action(
        mut self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
        action: Action<C>,
    ) -> Self {
        let from = from.into();
        let to = to.into();
        self.states.insert(from.clone());
        self.states.insert(to.clone());
        self.transitions.entry(from).or_default().push(Transition {
            event: event.into(),
            target: to,
            guard: None,
            action: Some(action),
        });
        self
    }

    pub fn build(self) -> StateMachineDefinition<C> {
        let initial = self.initial.expect("state machine must declare an initial state");
        StateMachineDefinition {
            initial,
            states: self.states,
            finals: self.finals,
            transitions: self.transitions,
            entry_actions: self.entry_actions,
        }
    }
}

pub struct Interpreter<C> {
    definition: Arc<StateMachineDefinition<C>>,
    context: C,
    current: String,
    queue: VecDeque<String>,
    processing: bool,
    stopped: bool,
    on_transition: Vec<TransitionObserver<C>>,
    on_done: Vec<DoneObserver<C>>,
    on_stop: Vec<StopObserver<C>>,
}

impl<C> Interpreter<C> {
    pub fn new(definition: Arc<StateMachineDefinition<C>>, context: C) -> Self {
        let current = definition.initial.clone();
        Self {
            definition,
            context,
            current,
            queue: VecDeque::new(),
            processing: false,
            stopped: false,
            on_transition: Vec::new(),
            on_done: Vec::new(),
            on_stop: Vec::new(),
        }
    }

    pub fn on_transition(&mut self, cb: TransitionObserver<C>) {
        self.on_transition.push(cb);
    }

    pub fn on_done(&mut self, cb: DoneObserver<C>) {
        self.on_done.push(cb);
    }

    pub fn on_stop(&mut self, cb: StopObserver<C>) {
        self.on_stop.push(cb);
    }

    /// Enters the initial state and runs its entry action.
    pub fn start(&mut self) {
        if let Some(entry) = self.definition.entry_actions.get(&self.current).cloned() {
            entry(&mut self.context);
        }
        if self.definition.finals.contains(&self.current) {
            for cb in self.on_done.clone() {
                cb(&self.context);
            }
        }
    }

    /// Advances the current state on `event`. The first transition whose
    /// guard (if any) passes is taken; further `send` calls made while this
    /// one is still processing (e.g. from a caller reacting synchronously
    /// to `on_transition`) are queued and drained in order, so re-entrant
    /// sends are serialized rather than interleaved.
    pub fn send(&mut self, event: impl Into<String>) {
        self.queue.push_back(event.into());
        if self.processing {
            return;
        }
        self.processing = true;
        while let Some(next) = self.queue.pop_front() {
            self.step(&next);
        }
        self.processing = false;
    }

    fn step(&mut self, event: &str) {
        if self.stopped {
            return;
        }

        let transitions = match self.definition.transitions.get(&self.current) {
            Some(t) => t,
            None => return,
        };

        let chosen = transitions.iter().find(|t| {
            t.event == event && t.guard.as_ref().map_or(true, |g| g(&self.context))
        });

        let Some(transition) = chosen else {
            return;
        };

        if let Some(action) = &transition.action {
            action(&mut self.context);
        }

        let from = std::mem::replace(&mut self.current, transition.target.clone());

        for cb in self.on_transition.clone() {
            cb(&from, &self.current, event, &self.context);
        }

        if let Some(entry) = self.definition.entry_actions.get(&self.current).cloned() {
            entry(&mut self.context);
        }

        if self.definition.finals.contains(&self.current) {
            for cb in self.on_done.clone() {
                cb(&self.context);
            }
        }
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for cb in self.on_stop.clone() {
            cb(&self.context);
        }
    }

    pub fn current_state(&self) -> &str {
        &self.current
    }

    pub fn is_final(&self) -> bool {
        self.definition.finals.contains(&self.current)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Ctx {
        count: u32,
    }

    fn traffic_light() -> StateMachineDefinition<Ctx> {
        StateMachineBuilder::new()
            .initial("red")
            .final_state("done")
            .transition("red", "TICK", "green")
            .transition("green", "TICK", "yellow")
            .transition("yellow", "TICK", "red")
            .guarded_transition("red", "STOP", "done", Arc::new(|ctx: &Ctx| ctx.count > 2))
            .build()
    }

    #[test]
    fn advances_on_matching_event_only() {
        let mut interp = Interpreter::new(Arc::new(traffic_light()), Ctx::default());
        interp.start();
        assert_eq!(interp.current_state(), "red");

        interp.send("TICK");
        assert_eq!(interp.current_state(), "green");

        interp.send("UNKNOWN_EVENT");
        assert_eq!(interp.current_state(), "green");
    }

    #[test]
    fn guard_blocks_transition_until_satisfied() {
        let mut interp = Interpreter::new(Arc::new(traffic_light()), Ctx::default());
        interp.start();

        interp.send("STOP");
        assert_eq!(interp.current_state(), "red");

        interp.context_mut().count = 3;
        interp.send("STOP");
        assert_eq!(interp.current_state(), "done");
        assert!(interp.is_final());
    }

    #[test]
    fn on_done_fires_on_final_state() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let mut interp = Interpreter::new(Arc::new(traffic_light()), Ctx { count: 5 });
        interp.on_done(Arc::new(move |_ctx| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        interp.start();
        interp.send("STOP");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_send_is_queued_not_interleaved() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let order_clone = order.clone();

        let def = StateMachineBuilder::new()
            .initial("a")
            .transition("a", "GO", "b")
            .transition("b", "GO", "c")
            .build();

        let mut interp = Interpreter::new(Arc::new(def), Ctx::default());
        interp.on_transition(Arc::new(move |from, to, _event, _ctx| {
            order_clone.lock().push(format!("{from}->{to}"));
        }));
        interp.start();

        interp.send("GO");
        interp.send("GO");

        assert_eq!(*order.lock(), vec!["a->b".to_string(), "b->c".to_string()]);
    }
}
