//! FFI bindings for native hosts
//!
//! This module provides the interface exposed via uniffi to Swift/Kotlin.

mod handlers;
mod session;
mod types;

pub use session::*;
pub use types::*;
