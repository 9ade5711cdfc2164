//! pai-slack-bridge: bridges Slack threads to a locally invoked Claude CLI
//! through a durable on-disk job queue.

pub mod claude;
pub mod config;
pub mod conversation;
pub mod error;
pub mod intake;
pub mod processor;
pub mod queue;
pub mod slack;

pub use error::{Error, Result};
