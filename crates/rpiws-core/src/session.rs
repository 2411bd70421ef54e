//! Stack-based session state machine shared by the broker and the agent.
//!
//! A connection owns a [`StateStack`]. Only the top state receives inbound
//! messages; state handlers never touch the stack themselves, they return a
//! [`Transition`] that the owner applies. Entry and exit hooks live on
//! [`Lifecycle`] and are invoked by the stack, never by the states.

use crate::protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session state stack is empty")]
pub struct EmptyStackError;

/// Failures that end a session. The owner closes the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("authentication failed for {mac}")]
    AuthenticationFailed { mac: String },
    #[error(transparent)]
    EmptyStack(#[from] EmptyStackError),
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::ProtocolViolation(err.to_string())
    }
}

/// Entry/exit hooks. `C` is whatever side-channel the owner hands the
/// hooks (an effect queue, a channel table, ...).
pub trait Lifecycle<C: ?Sized> {
    fn activated(&mut self, _ctx: &mut C) {}
    fn deactivated(&mut self, _ctx: &mut C) {}
}

/// What a state handler asks the stack to do after a message.
#[derive(Debug)]
pub enum Transition<S> {
    Stay,
    Push(S),
    Pop,
}

#[derive(Debug)]
pub struct StateStack<S> {
    states: Vec<S>,
}

impl<S> Default for StateStack<S> {
    fn default() -> Self {
        Self { states: Vec::new() }
    }
}

impl<S> StateStack<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn current(&self) -> Result<&S, EmptyStackError> {
        self.states.last().ok_or(EmptyStackError)
    }

    pub fn current_mut(&mut self) -> Result<&mut S, EmptyStackError> {
        self.states.last_mut().ok_or(EmptyStackError)
    }

    /// Makes `state` the new top and runs its `activated` hook.
    pub fn push<C: ?Sized>(&mut self, state: S, ctx: &mut C)
    where
        S: Lifecycle<C>,
    {
        self.states.push(state);
        if let Some(top) = self.states.last_mut() {
            top.activated(ctx);
        }
    }

    /// Removes the top state (running `deactivated`) and re-activates the
    /// state underneath, if any.
    pub fn pop<C: ?Sized>(&mut self, ctx: &mut C) -> Result<S, EmptyStackError>
    where
        S: Lifecycle<C>,
    {
        let mut popped = self.states.pop().ok_or(EmptyStackError)?;
        popped.deactivated(ctx);
        if let Some(top) = self.states.last_mut() {
            top.activated(ctx);
        }
        Ok(popped)
    }

    /// Applies a handler's transition. A `Pop` hands back the removed state.
    pub fn apply<C: ?Sized>(
        &mut self,
        transition: Transition<S>,
        ctx: &mut C,
    ) -> Result<Option<S>, EmptyStackError>
    where
        S: Lifecycle<C>,
    {
        match transition {
            Transition::Stay => Ok(None),
            Transition::Push(state) => {
                self.push(state, ctx);
                Ok(None)
            }
            Transition::Pop => self.pop(ctx).map(Some),
        }
    }

    /// Tears the whole stack down top-first without re-activating anything.
    pub fn clear<C: ?Sized>(&mut self, ctx: &mut C)
    where
        S: Lifecycle<C>,
    {
        while let Some(mut state) = self.states.pop() {
            state.deactivated(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Named(&'static str);

    impl Lifecycle<Vec<String>> for Named {
        fn activated(&mut self, log: &mut Vec<String>) {
            log.push(format!("+{}", self.0));
        }

        fn deactivated(&mut self, log: &mut Vec<String>) {
            log.push(format!("-{}", self.0));
        }
    }

    #[test]
    fn empty_stack_has_no_current_state() {
        let mut stack: StateStack<Named> = StateStack::new();
        let mut log: Vec<String> = Vec::new();
        assert_eq!(stack.current().unwrap_err(), EmptyStackError);
        assert_eq!(stack.pop(&mut log).unwrap_err(), EmptyStackError);
        assert!(log.is_empty());
    }

    #[test]
    fn push_activates_only_the_new_top() {
        let mut stack = StateStack::new();
        let mut log: Vec<String> = Vec::new();
        stack.push(Named("register"), &mut log);
        stack.push(Named("config"), &mut log);
        assert_eq!(log, vec!["+register", "+config"]);
        assert_eq!(stack.current().unwrap(), &Named("config"));
        assert_eq!(stack.depth(), 2);
    }

    #[test]
    fn pop_deactivates_and_reactivates_previous_top() {
        let mut stack = StateStack::new();
        let mut log: Vec<String> = Vec::new();
        stack.push(Named("config"), &mut log);
        stack.push(Named("stream"), &mut log);
        log.clear();

        let popped = stack.pop(&mut log).unwrap();
        assert_eq!(popped, Named("stream"));
        assert_eq!(log, vec!["-stream", "+config"]);
        assert_eq!(stack.current().unwrap(), &Named("config"));
    }

    #[test]
    fn apply_handles_every_transition() {
        let mut stack = StateStack::new();
        let mut log: Vec<String> = Vec::new();
        assert!(stack.apply(Transition::Push(Named("a")), &mut log).unwrap().is_none());
        assert!(stack.apply(Transition::Stay, &mut log).unwrap().is_none());
        assert_eq!(stack.apply(Transition::Pop, &mut log).unwrap(), Some(Named("a")));
        assert!(stack.apply(Transition::Pop, &mut log).is_err());
    }

    #[test]
    fn clear_deactivates_top_first() {
        let mut stack = StateStack::new();
        let mut log: Vec<String> = Vec::new();
        stack.push(Named("config"), &mut log);
        stack.push(Named("stream"), &mut log);
        log.clear();
        stack.clear(&mut log);
        assert_eq!(log, vec!["-stream", "-config"]);
        assert!(stack.is_empty());
    }
}
