//! Voice session engine
//!
//! The controller ties the duplex channel, audio pipeline, tools and wake
//! word listener together and publishes [`SessionSnapshot`]s for display.

mod commands;
mod controller;
mod state;
mod transcript;

pub use commands::{
    CommandTables, GreetingRule, IdentityRule, Interception, LocalCommandInterceptor, normalize,
};
pub use controller::{Levels, SessionConfig, SessionHandle, SessionServices};
pub use state::{ActivityFlags, Lifecycle, SessionSnapshot, SessionState};
pub use transcript::{CompletedTurn, Message, MessageLog, Sender, TranscriptionAggregator};
