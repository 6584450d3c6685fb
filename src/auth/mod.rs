//! Browser-mediated sign in and session management
//!
//! This module provides:
//! - Session storage in the per-user config directory
//! - The account linking URL the user opens in a browser
//! - A temporary callback server that receives the authorization code
//! - Token exchange against the cloud API
//! - `SignIn`, which ties the above together

mod session;
mod link;
mod callback_server;
mod token;
mod signin;

pub use session::{Session, SessionStore, Store};
pub use link::{build_linking_url, redirect_base};
pub use callback_server::{CallbackServer, Timeouts};
pub use token::{CloudClient, TokenExchange};
pub use signin::{SignIn, SIGNIN_MESSAGE};
