//! Fundlink - front end messaging client for the fund analysis backend
//!
//! Fundlink talks to the backend over two channels: a request/reply channel
//! for actions and a publish/subscribe channel for notifications. The
//! [`messaging::MessagingSession`] owns both.

pub mod config;
pub mod error;
pub mod id;
pub mod messaging;

pub use error::{FundlinkError, Result};
