//! Local Persistence
//!
//! A narrow key-value seam supplied by the host, with typed accessors for
//! everything the client keeps across restarts.

mod local;
mod store;

pub use local::*;
pub use store::*;
