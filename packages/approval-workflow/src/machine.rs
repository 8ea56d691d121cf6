//! Guarded finite state machines: a mutable builder and an immutable runtime.
//!
//! A [`StateMachineBuilder`] is the blueprint. For each state it holds an
//! ordered list of `trigger → [(target, guard)]` candidates. Calling
//! [`StateMachineBuilder::build`] compiles the blueprint into a fresh
//! transition table owned by the returned [`StateMachine`]; later edits to the
//! builder never reach machines that were already built, and firing a trigger
//! on one machine never affects another.
//!
//! # Candidates and guards
//!
//! Several candidates may be declared for the same `(state, trigger)`.
//! [`StateMachine::fire`] walks them in declaration order and takes the first
//! one whose guard is absent or passes. This is how data-dependent routing
//! (auto-approve vs manual review) is expressed.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = StateMachineBuilder::new();
//! builder
//!     .configure(State::AiAudited)
//!     .permit_if(Trigger::Approve, State::AutoApproved, |_ctx| low_risk)
//!     .permit(Trigger::Approve, State::InReview);
//!
//! let mut machine = builder.build(State::AiAudited);
//! machine.fire(&ctx, Trigger::Approve)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::context::Context;
use crate::error::MachineError;

/// Bounds shared by state and trigger types.
///
/// Closed enums are the intended implementors: an invalid state or trigger
/// cannot be named at all, so misconfiguration is caught by the compiler.
pub trait Label: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<L> Label for L where L: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// Predicate evaluated when a trigger fires; `false` vetoes the candidate.
pub type Guard = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

#[derive(Clone)]
struct Candidate<S> {
    target: S,
    guard: Option<Guard>,
}

impl<S: Label> Candidate<S> {
    fn admits(&self, ctx: &Context) -> bool {
        self.guard.as_ref().map_or(true, |guard| guard(ctx))
    }
}

/// Ordered `trigger → candidates` list for one state.
type Transitions<S, T> = Vec<(T, Vec<Candidate<S>>)>;

// =============================================================================
// Builder
// =============================================================================

/// Mutable configuration for a single state, owned by its builder.
pub struct StateConfiguration<S, T> {
    state: S,
    transitions: Transitions<S, T>,
}

impl<S: Label, T: Label> StateConfiguration<S, T> {
    fn new(state: S) -> Self {
        Self {
            state,
            transitions: Vec::new(),
        }
    }

    /// The state this configuration belongs to.
    pub fn state(&self) -> S {
        self.state
    }

    /// Allow `trigger` to move the machine to `to` unconditionally.
    pub fn permit(&mut self, trigger: T, to: S) -> &mut Self {
        self.push(trigger, Candidate { target: to, guard: None })
    }

    /// Allow `trigger` to move the machine to `to` when `guard` passes.
    pub fn permit_if<G>(&mut self, trigger: T, to: S, guard: G) -> &mut Self
    where
        G: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.push(
            trigger,
            Candidate {
                target: to,
                guard: Some(Arc::new(guard)),
            },
        )
    }

    fn push(&mut self, trigger: T, candidate: Candidate<S>) -> &mut Self {
        match self.transitions.iter_mut().find(|(t, _)| *t == trigger) {
            Some((_, candidates)) => candidates.push(candidate),
            None => self.transitions.push((trigger, vec![candidate])),
        }
        self
    }
}

/// Blueprint for state machines.
///
/// `configure` may be called any number of times for the same state; every
/// call returns the same configuration so transitions can be declared in any
/// order or from several places.
pub struct StateMachineBuilder<S, T> {
    states: HashMap<S, StateConfiguration<S, T>>,
}

impl<S: Label, T: Label> StateMachineBuilder<S, T> {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
        }
    }

    /// Get the configuration for `state`, creating an empty one if needed.
    pub fn configure(&mut self, state: S) -> &mut StateConfiguration<S, T> {
        self.states
            .entry(state)
            .or_insert_with(|| StateConfiguration::new(state))
    }

    /// Compile the blueprint into a machine starting in `initial`.
    ///
    /// The machine gets its own copy of the transition table.
    pub fn build(&self, initial: S) -> StateMachine<S, T> {
        let table = self
            .states
            .iter()
            .map(|(state, config)| (*state, config.transitions.clone()))
            .collect();

        StateMachine {
            state: initial,
            table: Arc::new(TransitionTable { states: table }),
        }
    }

    /// Number of states that have a configuration.
    pub fn configured_states(&self) -> usize {
        self.states.len()
    }
}

impl<S: Label, T: Label> Default for StateMachineBuilder<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Label, T: Label> fmt::Debug for StateMachineBuilder<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachineBuilder")
            .field("configured_states", &self.states.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Compiled, read-only transition table.
struct TransitionTable<S, T> {
    states: HashMap<S, Transitions<S, T>>,
}

impl<S: Label, T: Label> TransitionTable<S, T> {
    fn candidates(&self, state: S, trigger: T) -> Option<&[Candidate<S>]> {
        self.states
            .get(&state)?
            .iter()
            .find(|(t, _)| *t == trigger)
            .map(|(_, candidates)| candidates.as_slice())
            .filter(|candidates| !candidates.is_empty())
    }
}

/// A running state machine: a current state plus its compiled table.
///
/// Cloning yields an independent machine; the table itself is immutable.
pub struct StateMachine<S, T> {
    state: S,
    table: Arc<TransitionTable<S, T>>,
}

impl<S: Label, T: Label> StateMachine<S, T> {
    /// Current state.
    pub fn state(&self) -> S {
        self.state
    }

    /// True when at least one candidate exists for `trigger` from the current state.
    ///
    /// Guards are not evaluated, so `fire` may still fail with
    /// [`MachineError::GuardFailed`].
    pub fn can_fire(&self, trigger: T) -> bool {
        self.table.candidates(self.state, trigger).is_some()
    }

    /// Triggers with at least one candidate from the current state, in declaration order.
    pub fn permitted_triggers(&self) -> Vec<T> {
        self.table
            .states
            .get(&self.state)
            .map(|transitions| {
                transitions
                    .iter()
                    .filter(|(_, candidates)| !candidates.is_empty())
                    .map(|(trigger, _)| *trigger)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True when no trigger can leave the current state.
    pub fn is_terminal(&self) -> bool {
        self.permitted_triggers().is_empty()
    }

    /// Fire `trigger`, moving to the first candidate whose guard passes.
    ///
    /// Returns the new state. On error the current state is unchanged.
    pub fn fire(&mut self, ctx: &Context, trigger: T) -> Result<S, MachineError<S, T>> {
        let candidates = self
            .table
            .candidates(self.state, trigger)
            .ok_or(MachineError::InvalidTransition {
                state: self.state,
                trigger,
            })?;

        let target = candidates
            .iter()
            .find(|candidate| candidate.admits(ctx))
            .map(|candidate| candidate.target)
            .ok_or(MachineError::GuardFailed {
                state: self.state,
                trigger,
            })?;

        self.state = target;
        Ok(target)
    }
}

impl<S, T> Clone for StateMachine<S, T>
where
    S: Copy,
{
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            table: self.table.clone(),
        }
    }
}

impl<S: Label, T: Label> fmt::Debug for StateMachine<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state)
            .field("permitted_triggers", &self.permitted_triggers())
            .finish()
    }
}
