use thiserror::Error;

/// Lifecycle of one streaming session. `Failed` is terminal and is treated
/// like `Closed` for cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Opened,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Opened => "opened",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Stream already opened")]
    AlreadyOpened,
    #[error("Stream not opened yet")]
    NotOpened,
    #[error("Stream already closed")]
    AlreadyClosed,
}

impl ProtocolViolation {
    /// All misuse of the session lifecycle maps to FAILED_PRECONDITION (9).
    pub fn code(&self) -> tonic::Code {
        tonic::Code::FailedPrecondition
    }
}

/// Open/frame/close transitions shared by both ends of the stream.
///
/// Rejected transitions leave the state untouched. Closing is permissive:
/// a never-opened session closes with success, and closing twice is a no-op.
#[derive(Debug, Default)]
pub struct SessionMachine {
    state: SessionState,
    frames: u64,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn open(&mut self) -> Result<(), ProtocolViolation> {
        match self.state {
            SessionState::Idle => {
                self.state = SessionState::Opened;
                Ok(())
            }
            SessionState::Opened => Err(ProtocolViolation::AlreadyOpened),
            SessionState::Closed | SessionState::Failed => Err(ProtocolViolation::AlreadyClosed),
        }
    }

    /// Accepts one frame and returns the running frame count.
    pub fn frame(&mut self) -> Result<u64, ProtocolViolation> {
        match self.state {
            SessionState::Opened => {
                self.frames += 1;
                Ok(self.frames)
            }
            SessionState::Idle => Err(ProtocolViolation::NotOpened),
            SessionState::Closed | SessionState::Failed => Err(ProtocolViolation::AlreadyClosed),
        }
    }

    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Opened) {
            self.state = SessionState::Closed;
        }
    }

    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_before_open_is_rejected_without_state_change() {
        let mut machine = SessionMachine::new();

        let result = machine.frame();

        assert_eq!(result, Err(ProtocolViolation::NotOpened));
        assert_eq!(machine.state(), SessionState::Idle);
        assert_eq!(machine.frames(), 0);
        assert_eq!(
            ProtocolViolation::NotOpened.to_string(),
            "Stream not opened yet"
        );
        assert_eq!(ProtocolViolation::NotOpened.code() as i32, 9);
    }

    #[test]
    fn test_open_twice_is_rejected() {
        let mut machine = SessionMachine::new();
        machine.open().unwrap();

        assert_eq!(machine.open(), Err(ProtocolViolation::AlreadyOpened));
        assert_eq!(machine.state(), SessionState::Opened);
    }

    #[test]
    fn test_frames_are_counted_while_opened() {
        let mut machine = SessionMachine::new();
        machine.open().unwrap();

        assert_eq!(machine.frame(), Ok(1));
        assert_eq!(machine.frame(), Ok(2));
        assert_eq!(machine.frames(), 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut machine = SessionMachine::new();
        machine.open().unwrap();

        machine.close();
        machine.close();
        assert_eq!(machine.state(), SessionState::Closed);
        assert_eq!(machine.open(), Err(ProtocolViolation::AlreadyClosed));
    }

    // Closing a session that was never opened succeeds. This is the
    // permissive behaviour backends rely on, not an oversight.
    #[test]
    fn test_close_without_open_succeeds() {
        let mut machine = SessionMachine::new();

        machine.close();
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_frame_after_close_is_a_violation() {
        let mut machine = SessionMachine::new();
        machine.open().unwrap();
        machine.close();

        assert_eq!(machine.frame(), Err(ProtocolViolation::AlreadyClosed));
        assert_eq!(machine.frames(), 0);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut machine = SessionMachine::new();
        machine.open().unwrap();
        machine.fail();

        assert!(machine.state().is_terminal());
        machine.close();
        assert_eq!(machine.state(), SessionState::Failed);
    }
}
