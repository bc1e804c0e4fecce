//! Ordered transition runner shared by every query and mutation state machine.
//!
//! A machine is a list of transitions. Each transition looks at the current
//! state and an action and either proposes a next state or declines. The first
//! transition that proposes a state wins; if none does, the state is returned
//! unchanged.
//!
//! # Example
//!
//! ```
//! use store_query::state_machine::StateMachine;
//!
//! #[derive(Debug, PartialEq)]
//! enum Light { Off, On }
//! enum Press { Toggle }
//!
//! let machine = StateMachine::new(vec![
//!     Box::new(|state: &Light, _: &Press| matches!(state, Light::Off).then_some(Light::On)),
//!     Box::new(|state: &Light, _: &Press| matches!(state, Light::On).then_some(Light::Off)),
//! ]);
//!
//! assert_eq!(machine.run(Light::Off, &Press::Toggle), Light::On);
//! ```

use std::fmt;

/// A single rule: `Some(next)` when it applies to `(state, action)`, `None` otherwise.
pub type Transition<S, A> = Box<dyn Fn(&S, &A) -> Option<S> + Send + Sync>;

/// An ordered list of transitions.
pub struct StateMachine<S, A> {
    transitions: Vec<Transition<S, A>>,
}

impl<S, A> StateMachine<S, A> {
    /// Builds a machine from transitions, tried in the given order.
    #[must_use]
    pub fn new(transitions: Vec<Transition<S, A>>) -> Self {
        Self { transitions }
    }

    /// Applies the first matching transition, or returns `state` unchanged.
    pub fn run(&self, state: S, action: &A) -> S {
        let next = self
            .transitions
            .iter()
            .find_map(|transition| transition(&state, action));
        next.unwrap_or(state)
    }

    /// Number of transitions in the machine.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

impl<S, A> fmt::Debug for StateMachine<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("transitions", &self.transitions.len())
            .finish()
    }
}
