//! Core domain + application logic for the whispr relay bot.
//!
//! This crate is transport-agnostic. signal-cli lives behind the
//! [`messaging::port::Transport`] port, implemented in an adapter crate.

pub mod bot;
pub mod config;
pub mod domain;
pub mod errors;
pub mod graph;
pub mod intent;
pub mod logging;
pub mod messaging;
pub mod router;
pub mod security;
pub mod utils;

pub use errors::{Error, Result};
