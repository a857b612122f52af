// Player state machine: fine-grained internal state and the coarse public state derived from it

use crate::error::{AudioError, ErrorCode, Result};

/// Internal player state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalState {
    /// Freshly constructed, nothing queued yet
    Initialised,
    /// A play request arrived and the pipeline is spinning up
    StartingThread,
    /// Waiting for the first buffer of an item
    WaitingForData,
    /// Waiting for data after a user seek (not reported as buffering)
    WaitingForDataAfterSeek,
    /// Audio is being played
    Playing,
    /// Playback starved while the source is still being read
    Rebuffering,
    /// Paused by the user
    Paused,
    /// Stop requested, sink is being torn down
    Stopping,
    /// Playback has stopped
    Stopped,
    /// Unrecoverable error
    Error,
    /// Player disposed (terminal)
    Disposed,
}

/// Public player state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicState {
    Ready,
    Playing,
    Buffering,
    Paused,
    Stopped,
    Error,
    Disposed,
}

/// Why playback of an item ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    NoStop,
    Eof,
    UserAction,
    UserActionFlush,
    Error,
}

/// Composition flags of a public state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFlags {
    pub running: bool,
    pub playing: bool,
    pub buffering: bool,
    pub paused: bool,
}

impl StateFlags {
    const fn new(running: bool, playing: bool, buffering: bool, paused: bool) -> Self {
        Self {
            running,
            playing,
            buffering,
            paused,
        }
    }
}

impl PublicState {
    /// Composition table. Buffering is a kind of playing: both flags hold while rebuffering.
    pub const fn flags(self) -> StateFlags {
        match self {
            PublicState::Ready => StateFlags::new(false, false, false, false),
            PublicState::Playing => StateFlags::new(true, true, false, false),
            PublicState::Buffering => StateFlags::new(true, true, true, false),
            PublicState::Paused => StateFlags::new(true, false, false, true),
            PublicState::Stopped => StateFlags::new(false, false, false, false),
            PublicState::Error => StateFlags::new(false, false, false, false),
            PublicState::Disposed => StateFlags::new(false, false, false, false),
        }
    }

    pub fn is_running(self) -> bool {
        self.flags().running
    }

    pub fn is_playing(self) -> bool {
        self.flags().playing
    }

    pub fn is_buffering(self) -> bool {
        self.flags().buffering
    }
}

impl InternalState {
    /// Public state for this internal state
    pub const fn public_state(self) -> PublicState {
        match self {
            InternalState::Initialised => PublicState::Ready,
            InternalState::StartingThread => PublicState::Buffering,
            InternalState::WaitingForData => PublicState::Buffering,
            InternalState::Rebuffering => PublicState::Buffering,
            InternalState::WaitingForDataAfterSeek => PublicState::Playing,
            InternalState::Playing => PublicState::Playing,
            InternalState::Paused => PublicState::Paused,
            InternalState::Stopping => PublicState::Stopped,
            InternalState::Stopped => PublicState::Stopped,
            InternalState::Error => PublicState::Error,
            InternalState::Disposed => PublicState::Disposed,
        }
    }

    /// States in which the ingest and playback loops are active
    pub fn is_running(self) -> bool {
        matches!(
            self,
            InternalState::StartingThread
                | InternalState::WaitingForData
                | InternalState::WaitingForDataAfterSeek
                | InternalState::Playing
                | InternalState::Rebuffering
                | InternalState::Paused
        )
    }

    /// States that are waiting for the first buffer to arrive
    pub fn is_waiting_for_data(self) -> bool {
        matches!(
            self,
            InternalState::StartingThread
                | InternalState::WaitingForData
                | InternalState::WaitingForDataAfterSeek
                | InternalState::Rebuffering
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InternalState::Error | InternalState::Disposed)
    }
}

/// Outcome of a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old_internal: InternalState,
    pub new_internal: InternalState,
    pub old_public: PublicState,
    pub new_public: PublicState,
}

impl Transition {
    pub fn internal_changed(&self) -> bool {
        self.old_internal != self.new_internal
    }

    /// Public state changed; state-changed events fire only in this case
    pub fn public_changed(&self) -> bool {
        self.old_public != self.new_public
    }

    /// The running flag flipped (playback became active or inactive)
    pub fn activity_changed(&self) -> Option<bool> {
        let was = self.old_public.is_running();
        let now = self.new_public.is_running();
        if was != now {
            Some(now)
        } else {
            None
        }
    }
}

/// Single source of truth for the player state
#[derive(Debug, Clone)]
pub struct PlayerStateMachine {
    internal: InternalState,
    public: PublicState,
    error_code: Option<ErrorCode>,
    stop_reason: StopReason,
}

impl PlayerStateMachine {
    pub fn new() -> Self {
        Self {
            internal: InternalState::Initialised,
            public: PublicState::Ready,
            error_code: None,
            stop_reason: StopReason::NoStop,
        }
    }

    pub fn internal(&self) -> InternalState {
        self.internal
    }

    pub fn public(&self) -> PublicState {
        self.public
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn set_stop_reason(&mut self, reason: StopReason) {
        self.stop_reason = reason;
    }

    pub fn is_disposed(&self) -> bool {
        self.internal == InternalState::Disposed
    }

    pub fn is_error(&self) -> bool {
        self.internal == InternalState::Error
    }

    /// Fails fast for operations that are no longer allowed
    pub fn ensure_usable(&self) -> Result<()> {
        match self.internal {
            InternalState::Disposed => Err(AudioError::Disposed),
            InternalState::Error => Err(AudioError::InvalidState(
                "Player is in the error state; only dispose is allowed".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Transition table
    pub fn can_transition(from: InternalState, to: InternalState) -> bool {
        use InternalState::*;

        if from == to {
            return !matches!(from, Disposed);
        }

        match (from, to) {
            // Disposal is absorbing
            (Disposed, _) => false,
            (_, Disposed) => true,

            // Error is terminal apart from disposal
            (Error, _) => false,
            (_, Error) => true,

            // Play requests
            (Initialised | Stopping | Stopped, StartingThread) => true,
            (Initialised, Stopped) => true,

            (StartingThread, WaitingForData | WaitingForDataAfterSeek | Playing | Paused) => true,
            (WaitingForData, Playing | Paused | WaitingForDataAfterSeek | StartingThread) => true,
            (
                WaitingForDataAfterSeek,
                Playing | Paused | WaitingForData | Rebuffering | StartingThread,
            ) => true,
            (
                Playing,
                Rebuffering | Paused | WaitingForDataAfterSeek | WaitingForData | StartingThread,
            ) => true,
            (
                Rebuffering,
                Playing | Paused | WaitingForDataAfterSeek | WaitingForData | StartingThread,
            ) => true,
            (
                Paused,
                Playing | Rebuffering | WaitingForData | WaitingForDataAfterSeek | StartingThread,
            ) => true,

            // Any running state may stop
            (
                StartingThread
                | WaitingForData
                | WaitingForDataAfterSeek
                | Playing
                | Rebuffering
                | Paused,
                Stopping | Stopped,
            ) => true,
            (Stopping, Stopped) => true,

            // Invalid transitions
            _ => false,
        }
    }

    /// Move to a new internal state
    pub fn transition(&mut self, to: InternalState) -> Result<Transition> {
        if self.internal == InternalState::Disposed {
            return Err(AudioError::Disposed);
        }
        if !Self::can_transition(self.internal, to) {
            return Err(AudioError::InvalidState(format!(
                "Invalid state transition from {:?} to {:?}",
                self.internal, to
            )));
        }
        Ok(self.apply(to))
    }

    /// Enter the error state, recording the error code
    pub fn fail(&mut self, code: ErrorCode) -> Result<Transition> {
        if self.internal == InternalState::Disposed {
            return Err(AudioError::Disposed);
        }
        if self.internal != InternalState::Error {
            self.error_code = Some(code);
            self.stop_reason = StopReason::Error;
        }
        Ok(self.apply(InternalState::Error))
    }

    /// Enter the disposed state. Idempotent: returns None when already disposed.
    pub fn dispose(&mut self) -> Option<Transition> {
        if self.internal == InternalState::Disposed {
            return None;
        }
        Some(self.apply(InternalState::Disposed))
    }

    fn apply(&mut self, to: InternalState) -> Transition {
        let transition = Transition {
            old_internal: self.internal,
            new_internal: to,
            old_public: self.public,
            new_public: to.public_state(),
        };
        self.internal = to;
        self.public = to.public_state();
        if transition.internal_changed() {
            log::debug!("Player state changed: {:?} -> {:?}", transition.old_internal, to);
        }
        transition
    }
}

impl Default for PlayerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuffering_is_both_playing_and_buffering() {
        let public = InternalState::Rebuffering.public_state();
        assert_eq!(public, PublicState::Buffering);
        assert!(public.is_playing());
        assert!(public.is_buffering());
        assert!(public.is_running());
    }

    #[test]
    fn seek_wait_is_not_reported_as_buffering() {
        assert_eq!(InternalState::WaitingForDataAfterSeek.public_state(), PublicState::Playing);
        assert_eq!(InternalState::WaitingForData.public_state(), PublicState::Buffering);
    }

    #[test]
    fn public_change_only_when_public_state_differs() {
        let mut machine = PlayerStateMachine::new();
        let t = machine.transition(InternalState::StartingThread).unwrap();
        assert!(t.public_changed());
        assert_eq!(t.activity_changed(), Some(true));

        // StartingThread and WaitingForData are both "buffering"
        let t = machine.transition(InternalState::WaitingForData).unwrap();
        assert!(t.internal_changed());
        assert!(!t.public_changed());
        assert_eq!(t.activity_changed(), None);
    }

    #[test]
    fn stopped_can_restart() {
        let mut machine = PlayerStateMachine::new();
        machine.transition(InternalState::StartingThread).unwrap();
        machine.transition(InternalState::Playing).unwrap();
        machine.transition(InternalState::Stopping).unwrap();
        machine.transition(InternalState::Stopped).unwrap();
        assert!(machine.transition(InternalState::StartingThread).is_ok());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut machine = PlayerStateMachine::new();
        let err = machine.transition(InternalState::Paused).unwrap_err();
        assert!(matches!(err, AudioError::InvalidState(_)));
        assert_eq!(machine.internal(), InternalState::Initialised);
    }

    #[test]
    fn error_records_code_and_only_allows_dispose() {
        let mut machine = PlayerStateMachine::new();
        machine.transition(InternalState::StartingThread).unwrap();
        let t = machine.fail(ErrorCode::DataSource).unwrap();
        assert_eq!(t.new_public, PublicState::Error);
        assert_eq!(machine.error_code(), Some(ErrorCode::DataSource));
        assert_eq!(machine.stop_reason(), StopReason::Error);
        assert!(machine.transition(InternalState::StartingThread).is_err());
        assert!(machine.ensure_usable().is_err());
        assert!(machine.dispose().is_some());
    }

    #[test]
    fn dispose_is_idempotent_and_absorbing() {
        let mut machine = PlayerStateMachine::new();
        assert!(machine.dispose().is_some());
        assert!(machine.dispose().is_none());
        assert_eq!(machine.transition(InternalState::StartingThread), Err(AudioError::Disposed));
        assert_eq!(machine.fail(ErrorCode::Other), Err(AudioError::Disposed));
        assert_eq!(machine.public(), PublicState::Disposed);
    }

    #[test]
    fn disposed_reachable_from_every_state() {
        use InternalState::*;
        for from in [
            Initialised,
            StartingThread,
            WaitingForData,
            WaitingForDataAfterSeek,
            Playing,
            Rebuffering,
            Paused,
            Stopping,
            Stopped,
            Error,
        ] {
            assert!(PlayerStateMachine::can_transition(from, Disposed), "{:?}", from);
        }
    }
}
