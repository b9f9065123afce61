//! Pure session state machine.
//!
//! [`Lifecycle::apply`] takes one trigger, updates the state and returns the
//! side effects to run. It performs no I/O, so every transition can be tested
//! by feeding synthetic triggers. The session worker executes the effects in
//! the order they are returned.

use waengine_protocol::SessionState;

/// Something that may move a session to another state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    ConnectRequested,
    PairingCode { generation: u64, code: String },
    Ready { generation: u64, account: String },
    Disconnected { generation: u64, reason: String },
    StartupFailed { generation: u64, reason: String },
    /// Stale credentials found at process start.
    Reconcile,
    /// Process is shutting down.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Construct and start a protocol client tagged with `generation`.
    StartClient { generation: u64 },
    ShowPairingCode { code: String },
    AnnounceReady { account: String },
    ReportConnected { account: String },
    DestroyClient,
    DeleteCredentials,
    ReportDisconnected,
}

/// Answer to a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new protocol client was started.
    Started,
    /// A client is already starting or waiting to be paired.
    AlreadyInitializing,
    AlreadyConnected,
}

/// Result of applying one trigger.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub reply: Option<ConnectOutcome>,
    pub effects: Vec<Effect>,
}

impl Step {
    fn none() -> Self {
        Self::default()
    }

    fn effects(effects: Vec<Effect>) -> Self {
        Self {
            reply: None,
            effects,
        }
    }

    fn reply(outcome: ConnectOutcome, effects: Vec<Effect>) -> Self {
        Self {
            reply: Some(outcome),
            effects,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Lifecycle {
    state: SessionState,
    account: Option<String>,
    generation: u64,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Present iff the state is `Connected`.
    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    /// Generation of the most recently started client.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn apply(&mut self, trigger: Trigger) -> Step {
        use SessionState::*;

        match trigger {
            Trigger::ConnectRequested => match self.state {
                Uninitialized | Disconnected => {
                    self.generation += 1;
                    self.state = Initializing;
                    Step::reply(
                        ConnectOutcome::Started,
                        vec![Effect::StartClient {
                            generation: self.generation,
                        }],
                    )
                }
                Initializing | AwaitingPairing => {
                    Step::reply(ConnectOutcome::AlreadyInitializing, vec![])
                }
                Connected => Step::reply(ConnectOutcome::AlreadyConnected, vec![]),
            },

            Trigger::PairingCode { generation, code } => {
                if !self.is_current(generation) {
                    return Step::none();
                }
                match self.state {
                    Initializing | AwaitingPairing => {
                        self.state = AwaitingPairing;
                        Step::effects(vec![Effect::ShowPairingCode { code }])
                    }
                    // A code racing the ready signal must never reach viewers.
                    _ => Step::none(),
                }
            }

            Trigger::Ready {
                generation,
                account,
            } => {
                if !self.is_current(generation) || !matches!(self.state, Initializing | AwaitingPairing)
                {
                    return Step::none();
                }
                self.state = Connected;
                self.account = Some(account.clone());
                Step::effects(vec![
                    Effect::AnnounceReady {
                        account: account.clone(),
                    },
                    Effect::ReportConnected { account },
                ])
            }

            Trigger::Disconnected { generation, .. } => {
                if !self.is_current(generation) || !self.state.is_live() {
                    return Step::none();
                }
                self.teardown()
            }

            // Start-up can only fail before the client is ready; a late
            // initialize error or timeout leaves a connected session alone.
            Trigger::StartupFailed { generation, .. } => {
                if !self.is_current(generation)
                    || !matches!(self.state, Initializing | AwaitingPairing)
                {
                    return Step::none();
                }
                self.teardown()
            }

            Trigger::Reconcile => match self.state {
                Uninitialized | Disconnected => {
                    self.enter_disconnected();
                    Step::effects(vec![Effect::DeleteCredentials, Effect::ReportDisconnected])
                }
                // A live client owns the credentials now.
                _ => Step::none(),
            },

            Trigger::Shutdown => {
                if !self.state.is_live() {
                    return Step::none();
                }
                self.enter_disconnected();
                Step::effects(vec![Effect::DestroyClient])
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    fn teardown(&mut self) -> Step {
        self.enter_disconnected();
        Step::effects(vec![
            Effect::DestroyClient,
            Effect::DeleteCredentials,
            Effect::ReportDisconnected,
        ])
    }

    fn enter_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
        self.account = None;
    }
}
