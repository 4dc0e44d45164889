//! Explicit connection state machine.
//!
//! One pure transition function computes the successor state and the actions
//! the connector must perform. The machine never touches sockets or timers
//! itself, which keeps every invariant testable without I/O.

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Identifying,
    Registering,
    LoggingIn,
    Granting,
    Idle,
    Downloading,
    Closing,
    Retry,
    Error,
}

impl ConnectionState {
    /// States with a live (or opening) connection.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Disconnected | Self::Retry | Self::Error)
    }

    /// States in which regular exchange messages are acceptable.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::Downloading)
    }
}

/// Events submitted to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Connected,
    Disconnected,
    Identify,
    AwaitRegister,
    AwaitLogin,
    AwaitGranted,
    Account,
    Download,
    Downloaded,
    Close,
    Reconnect,
    BasicError,
    FatalError,
    NoConnect,
}

/// Side effects the connector performs in response to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    OpenConnection,
    CloseConnection,
    ScheduleRetry,
    CancelRetry,
    EnterIdle,
    LeaveActive,
    ReportFatal,
    EmitFinalized,
}

/// What to do once a close in flight completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClosePending {
    Final,
    Retry,
    Fatal,
}

/// The machine: current state plus the closing flag and the pending close
/// disposition.
#[derive(Debug)]
pub struct Machine {
    state: ConnectionState,
    is_closing: bool,
    pending: ClosePending,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            is_closing: false,
            pending: ClosePending::Final,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing
    }

    /// Arm the closing guard. Once set, the machine initiates no new work.
    pub fn set_closing(&mut self) {
        self.is_closing = true;
    }

    fn enter_closing(&mut self, pending: ClosePending) -> Vec<Action> {
        self.state = ConnectionState::Closing;
        self.pending = pending;
        vec![Action::CloseConnection]
    }

    /// Process one event. Returns the actions to perform, in order.
    pub fn handle(&mut self, event: StateEvent) -> Vec<Action> {
        use ConnectionState as S;
        use StateEvent as E;

        // The closing guard wins over everything except the events that
        // drive the shutdown itself.
        if self.is_closing && !matches!(event, E::Close | E::Disconnected | E::NoConnect) {
            return Vec::new();
        }

        match (self.state, event) {
            // -- Disconnected ------------------------------------------------
            (S::Disconnected, E::Reconnect) => {
                self.state = S::Connecting;
                vec![Action::OpenConnection]
            }
            (S::Disconnected, E::Close) => vec![Action::EmitFinalized],

            // -- Retry -------------------------------------------------------
            (S::Retry, E::Reconnect) => {
                self.state = S::Connecting;
                vec![Action::CancelRetry, Action::OpenConnection]
            }
            (S::Retry, E::Close) => {
                self.state = S::Disconnected;
                vec![Action::CancelRetry, Action::EmitFinalized]
            }
            (S::Retry, E::FatalError) => {
                self.state = S::Error;
                vec![Action::CancelRetry, Action::ReportFatal]
            }

            // -- Error -------------------------------------------------------
            (S::Error, E::Reconnect) => {
                self.state = S::Connecting;
                vec![Action::OpenConnection]
            }
            (S::Error, E::Close) => {
                self.state = S::Disconnected;
                vec![Action::EmitFinalized]
            }

            // -- Closing -----------------------------------------------------
            (S::Closing, E::Disconnected) => {
                if self.is_closing {
                    self.state = S::Disconnected;
                    return vec![Action::LeaveActive, Action::EmitFinalized];
                }
                match self.pending {
                    ClosePending::Final => {
                        self.state = S::Disconnected;
                        vec![Action::LeaveActive]
                    }
                    ClosePending::Retry => {
                        self.state = S::Retry;
                        vec![Action::LeaveActive, Action::ScheduleRetry]
                    }
                    ClosePending::Fatal => {
                        self.state = S::Error;
                        vec![Action::LeaveActive, Action::ReportFatal]
                    }
                }
            }
            (S::Closing, E::FatalError) => {
                self.pending = ClosePending::Fatal;
                Vec::new()
            }
            // Reconnect while closing is a no-op.
            (S::Closing, _) => Vec::new(),

            // -- Connecting --------------------------------------------------
            (S::Connecting, E::Connected) => {
                self.state = S::Connected;
                Vec::new()
            }
            (S::Connecting, E::NoConnect) => {
                self.state = S::Disconnected;
                vec![Action::LeaveActive]
            }
            // The server may talk before the connected event is processed.
            (S::Connecting, E::Identify) => {
                self.state = S::Identifying;
                Vec::new()
            }
            // Reconnect while connecting is a no-op.
            (S::Connecting, E::Reconnect) => Vec::new(),

            // -- Connected / Identifying ------------------------------------
            (S::Connected, E::Identify) => {
                self.state = S::Identifying;
                Vec::new()
            }
            (S::Identifying, E::AwaitRegister) => {
                self.state = S::Registering;
                Vec::new()
            }
            (S::Identifying, E::AwaitLogin) => {
                self.state = S::LoggingIn;
                Vec::new()
            }
            (S::Identifying, E::AwaitGranted) => {
                self.state = S::Granting;
                Vec::new()
            }

            // -- Authentication results -------------------------------------
            (S::Registering | S::LoggingIn | S::Granting, E::Account) => {
                self.state = S::Idle;
                vec![Action::EnterIdle]
            }

            // -- Idle / Downloading -----------------------------------------
            (S::Idle, E::Download) => {
                self.state = S::Downloading;
                Vec::new()
            }
            (S::Downloading, E::Downloaded) => {
                self.state = S::Idle;
                vec![Action::EnterIdle]
            }

            // -- Shared transitions of every active state -------------------
            (state, E::Disconnected) if state.is_active() => {
                if self.is_closing {
                    self.state = S::Disconnected;
                    vec![Action::LeaveActive, Action::EmitFinalized]
                } else {
                    self.state = S::Retry;
                    vec![Action::LeaveActive, Action::ScheduleRetry]
                }
            }
            (state, E::Close) if state.is_active() => self.enter_closing(ClosePending::Final),
            // A requested reconnect tears the connection down and goes
            // through the retry schedule like any other recoverable drop.
            (state, E::Reconnect) if state.is_active() => self.enter_closing(ClosePending::Retry),
            (state, E::BasicError) if state.is_active() => self.enter_closing(ClosePending::Retry),
            (state, E::FatalError) if state.is_active() => self.enter_closing(ClosePending::Fatal),

            // Everything else is ignored.
            _ => Vec::new(),
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState as S;
    use StateEvent as E;

    fn drive(machine: &mut Machine, events: &[E]) {
        for event in events {
            machine.handle(*event);
        }
    }

    #[test]
    fn happy_path_login() {
        let mut machine = Machine::new();
        assert_eq!(machine.state(), S::Disconnected);

        assert_eq!(machine.handle(E::Reconnect), vec![Action::OpenConnection]);
        assert_eq!(machine.state(), S::Connecting);

        machine.handle(E::Connected);
        assert_eq!(machine.state(), S::Connected);

        machine.handle(E::Identify);
        assert_eq!(machine.state(), S::Identifying);

        machine.handle(E::AwaitLogin);
        assert_eq!(machine.state(), S::LoggingIn);

        assert_eq!(machine.handle(E::Account), vec![Action::EnterIdle]);
        assert_eq!(machine.state(), S::Idle);
    }

    #[test]
    fn registration_path() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected, E::Identify, E::AwaitRegister]);
        assert_eq!(machine.state(), S::Registering);
        machine.handle(E::Account);
        assert_eq!(machine.state(), S::Idle);
    }

    #[test]
    fn granting_path() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected, E::Identify, E::AwaitGranted]);
        assert_eq!(machine.state(), S::Granting);
        machine.handle(E::Account);
        assert_eq!(machine.state(), S::Idle);
    }

    #[test]
    fn identify_during_connecting_is_tolerated() {
        // Event order can be: open -> server frame -> connected event.
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Identify]);
        assert_eq!(machine.state(), S::Identifying);
    }

    #[test]
    fn disconnect_from_active_schedules_retry() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected]);

        let actions = machine.handle(E::Disconnected);
        assert_eq!(actions, vec![Action::LeaveActive, Action::ScheduleRetry]);
        assert_eq!(machine.state(), S::Retry);

        // Retry timer fires.
        let actions = machine.handle(E::Reconnect);
        assert_eq!(actions, vec![Action::CancelRetry, Action::OpenConnection]);
        assert_eq!(machine.state(), S::Connecting);
    }

    #[test]
    fn basic_error_closes_then_retries() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected, E::Identify, E::AwaitLogin, E::Account]);

        assert_eq!(machine.handle(E::BasicError), vec![Action::CloseConnection]);
        assert_eq!(machine.state(), S::Closing);

        let actions = machine.handle(E::Disconnected);
        assert_eq!(actions, vec![Action::LeaveActive, Action::ScheduleRetry]);
        assert_eq!(machine.state(), S::Retry);
    }

    #[test]
    fn fatal_error_ends_in_error_state() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected]);

        machine.handle(E::FatalError);
        assert_eq!(machine.state(), S::Closing);

        let actions = machine.handle(E::Disconnected);
        assert_eq!(actions, vec![Action::LeaveActive, Action::ReportFatal]);
        assert_eq!(machine.state(), S::Error);

        // Manual recovery is possible.
        assert_eq!(machine.handle(E::Reconnect), vec![Action::OpenConnection]);
        assert_eq!(machine.state(), S::Connecting);
    }

    #[test]
    fn reconnect_while_connecting_is_noop() {
        let mut machine = Machine::new();
        machine.handle(E::Reconnect);
        assert_eq!(machine.state(), S::Connecting);

        assert!(machine.handle(E::Reconnect).is_empty());
        assert_eq!(machine.state(), S::Connecting);
    }

    #[test]
    fn reconnect_while_closing_is_noop() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected, E::Close]);
        assert_eq!(machine.state(), S::Closing);

        assert!(machine.handle(E::Reconnect).is_empty());
        assert_eq!(machine.state(), S::Closing);
    }

    #[test]
    fn reconnect_from_idle_goes_through_closing_and_retry() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected, E::Identify, E::AwaitLogin, E::Account]);
        assert_eq!(machine.state(), S::Idle);

        assert_eq!(machine.handle(E::Reconnect), vec![Action::CloseConnection]);
        assert_eq!(machine.state(), S::Closing);

        let actions = machine.handle(E::Disconnected);
        assert_eq!(actions, vec![Action::LeaveActive, Action::ScheduleRetry]);
        assert_eq!(machine.state(), S::Retry);

        assert_eq!(
            machine.handle(E::Reconnect),
            vec![Action::CancelRetry, Action::OpenConnection]
        );
        assert_eq!(machine.state(), S::Connecting);
    }

    #[test]
    fn download_cycle_returns_to_idle() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected, E::Identify, E::AwaitLogin, E::Account]);

        machine.handle(E::Download);
        assert_eq!(machine.state(), S::Downloading);
        assert!(machine.state().is_idle());

        assert_eq!(machine.handle(E::Downloaded), vec![Action::EnterIdle]);
        assert_eq!(machine.state(), S::Idle);
    }

    #[test]
    fn closing_guard_finalizes_from_idle() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected, E::Identify, E::AwaitLogin, E::Account]);

        machine.set_closing();
        assert_eq!(machine.handle(E::Close), vec![Action::CloseConnection]);
        assert_eq!(machine.state(), S::Closing);

        let actions = machine.handle(E::Disconnected);
        assert_eq!(actions, vec![Action::LeaveActive, Action::EmitFinalized]);
        assert_eq!(machine.state(), S::Disconnected);
    }

    #[test]
    fn closing_guard_blocks_new_work() {
        let mut machine = Machine::new();
        machine.set_closing();
        assert!(machine.handle(E::Reconnect).is_empty());
        assert_eq!(machine.state(), S::Disconnected);
    }

    #[test]
    fn no_connect_returns_to_disconnected() {
        let mut machine = Machine::new();
        machine.handle(E::Reconnect);
        let actions = machine.handle(E::NoConnect);
        assert_eq!(actions, vec![Action::LeaveActive]);
        assert_eq!(machine.state(), S::Disconnected);
    }

    #[test]
    fn fatal_error_during_close_overrides_disposition() {
        let mut machine = Machine::new();
        drive(&mut machine, &[E::Reconnect, E::Connected, E::BasicError]);
        assert_eq!(machine.state(), S::Closing);

        machine.handle(E::FatalError);
        let actions = machine.handle(E::Disconnected);
        assert_eq!(actions, vec![Action::LeaveActive, Action::ReportFatal]);
        assert_eq!(machine.state(), S::Error);
    }

    #[test]
    fn unexpected_events_are_ignored() {
        let mut machine = Machine::new();
        assert!(machine.handle(E::Account).is_empty());
        assert!(machine.handle(E::Download).is_empty());
        assert_eq!(machine.state(), S::Disconnected);
    }
}
