//! Player
//!
//! The reconciler owns the shared playback state and drives the platform
//! device from both local actions and server updates.

mod device;
mod reconciler;

pub use device::*;
pub use reconciler::*;
