//! HTTP client for the Mintling cloud sync API.

mod client;
mod error;
mod types;

pub use client::ConnectClient;
pub use error::{ConnectError, Result};
pub use types::*;
