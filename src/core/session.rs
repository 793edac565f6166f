//! Purpose: Per-front-end session state: environment handle, line counter, client lifecycle.
//! Exports: `Session`, `ClientState`.
//! Role: The only shared mutable state in the kernel; owned by the execution coordinator.
//! Invariants: The line counter is monotonically non-decreasing except via `reset_line`.
//! Invariants: The client lifecycle moves `Uninitialized -> Initialized` exactly once.

/// Whether the one-time client payload has been sent for this session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClientState {
    Uninitialized,
    Initialized,
}

#[derive(Debug)]
pub struct Session<Env> {
    environment: Env,
    line_counter: u64,
    client: ClientState,
}

impl<Env> Session<Env> {
    pub fn new(environment: Env) -> Self {
        Self {
            environment,
            line_counter: 0,
            client: ClientState::Uninitialized,
        }
    }

    pub fn environment(&self) -> &Env {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut Env {
        &mut self.environment
    }

    pub fn current_line(&self) -> u64 {
        self.line_counter
    }

    /// Move the counter forward to `to`; a lower value leaves it untouched.
    pub fn advance_line(&mut self, to: u64) {
        if to < self.line_counter {
            tracing::debug!(
                current = self.line_counter,
                reported = to,
                "ignoring line counter regression"
            );
            return;
        }
        self.line_counter = to;
    }

    pub fn reset_line(&mut self) {
        self.line_counter = 0;
    }

    pub fn client_state(&self) -> ClientState {
        self.client
    }

    /// Transition to `Initialized`. Returns true only on the call that performed the transition.
    pub fn mark_client_initialized(&mut self) -> bool {
        match self.client {
            ClientState::Uninitialized => {
                self.client = ClientState::Initialized;
                true
            }
            ClientState::Initialized => false,
        }
    }
}
