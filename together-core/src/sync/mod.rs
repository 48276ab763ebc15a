//! Sync Model
//!
//! Wire messages and the shared playback state they describe.

mod protocol;
mod state;

pub use protocol::*;
pub use state::*;
