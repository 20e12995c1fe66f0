#![warn(missing_docs)]
//! Core primitives shared across the workspace.

mod clock;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};

/// Which kind of server this process runs.
///
/// Decides the phase a connection enters once its handshake converges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Account authentication server.
    Auth,
    /// Game (channel) server.
    #[default]
    Game,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerMode::Auth => "auth",
            ServerMode::Game => "game",
        })
    }
}

/// Unrecognised server mode name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown server mode `{0}` (expected `auth` or `game`)")]
pub struct ParseModeError(String);

impl FromStr for ServerMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auth" => Ok(ServerMode::Auth),
            "game" => Ok(ServerMode::Game),
            _ => Err(ParseModeError(s.to_owned())),
        }
    }
}
