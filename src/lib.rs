//! cloudlink - sign a command line tool into a cloud service
//!
//! The CLI never sees a password: it prints a linking URL, the user approves
//! it in a browser, and the browser hands an authorization code back to a
//! short-lived local server. The code is exchanged for a session token that is
//! kept in a per-user store.

pub mod auth;
pub mod config;
pub mod error;
pub mod ui;

pub use error::{Error, Result};
