//! Session state store

use serde::Serialize;

use super::transcript::Message;

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Lifecycle {
    /// Not connected
    #[default]
    Idle,
    /// Opening the duplex channel
    Connecting,
    /// Connected and streaming
    Active,
    /// Asleep, waiting for the wake word
    Standby,
    /// Wake word heard, reconnecting
    WakingUp,
    /// Tearing down into standby
    ShuttingDown,
    /// Stopped after a channel or capture failure
    Error,
}

/// What the session is doing right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivityFlags {
    /// The user's speech is being transcribed
    pub listening: bool,
    /// The user's turn ended, or a typed reply was requested, and no answer
    /// has arrived yet
    pub thinking: bool,
    /// Speech is queued or playing
    pub speaking: bool,
    /// Tool calls are running
    pub processing: bool,
}

/// Primary status shown to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    /// Not connected
    #[default]
    Idle,
    /// Opening the duplex channel
    Connecting,
    /// Connected, nothing in particular happening
    Active,
    /// User speech arriving
    Listening,
    /// Waiting on a reply
    Thinking,
    /// Playing speech
    Speaking,
    /// Running tools
    Processing,
    /// Asleep, waiting for the wake word
    Standby,
    /// Reconnecting after the wake word
    WakingUp,
    /// Going to sleep
    ShuttingDown,
    /// Stopped after a failure
    Error,
}

impl SessionState {
    /// Resolve the displayed state
    ///
    /// While idle or active, activity flags win by fixed priority:
    /// processing, speaking, thinking, listening.
    #[must_use]
    pub const fn resolve(lifecycle: Lifecycle, flags: ActivityFlags) -> Self {
        match lifecycle {
            Lifecycle::Idle | Lifecycle::Active => {
                if flags.processing {
                    Self::Processing
                } else if flags.speaking {
                    Self::Speaking
                } else if flags.thinking {
                    Self::Thinking
                } else if flags.listening {
                    Self::Listening
                } else if matches!(lifecycle, Lifecycle::Active) {
                    Self::Active
                } else {
                    Self::Idle
                }
            }
            Lifecycle::Connecting => Self::Connecting,
            Lifecycle::Standby => Self::Standby,
            Lifecycle::WakingUp => Self::WakingUp,
            Lifecycle::ShuttingDown => Self::ShuttingDown,
            Lifecycle::Error => Self::Error,
        }
    }

    /// Short label for display
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Processing => "processing",
            Self::Standby => "standby",
            Self::WakingUp => "waking up",
            Self::ShuttingDown => "shutting down",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything the presentation layer renders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Displayed state
    pub state: SessionState,
    /// Underlying lifecycle
    pub lifecycle: Lifecycle,
    /// Activity flags
    pub flags: ActivityFlags,
    /// Conversation so far
    pub messages: Vec<Message>,
    /// Last failure, cleared on restart
    pub error: Option<String>,
    /// Whether wake word listening works on this machine
    pub wake_word_available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let all = ActivityFlags {
            listening: true,
            thinking: true,
            speaking: true,
            processing: true,
        };
        assert_eq!(SessionState::resolve(Lifecycle::Active, all), SessionState::Processing);

        let no_processing = ActivityFlags {
            processing: false,
            ..all
        };
        assert_eq!(
            SessionState::resolve(Lifecycle::Active, no_processing),
            SessionState::Speaking
        );

        let thinking = ActivityFlags {
            listening: true,
            thinking: true,
            ..ActivityFlags::default()
        };
        assert_eq!(SessionState::resolve(Lifecycle::Active, thinking), SessionState::Thinking);

        let listening = ActivityFlags {
            listening: true,
            ..ActivityFlags::default()
        };
        assert_eq!(SessionState::resolve(Lifecycle::Active, listening), SessionState::Listening);
        assert_eq!(
            SessionState::resolve(Lifecycle::Active, ActivityFlags::default()),
            SessionState::Active
        );
    }

    #[test]
    fn test_flags_do_not_override_other_lifecycles() {
        let busy = ActivityFlags {
            speaking: true,
            ..ActivityFlags::default()
        };
        assert_eq!(SessionState::resolve(Lifecycle::Standby, busy), SessionState::Standby);
        assert_eq!(SessionState::resolve(Lifecycle::Error, busy), SessionState::Error);
        assert_eq!(SessionState::resolve(Lifecycle::Idle, busy), SessionState::Speaking);
        assert_eq!(
            SessionState::resolve(Lifecycle::Idle, ActivityFlags::default()),
            SessionState::Idle
        );
    }
}
