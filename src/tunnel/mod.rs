//! Tunnel lifecycle
//!
//! ```text
//! Idle -> Preparing -> ResolvingAddress -> ApplyingSettings -> StartingEngine -> Running
//!                                                                               |
//! Idle <------------------------------- Stopping <------------------------------+
//! ```
//!
//! Any step before `Running` may end in `Failed`.

mod manager;
mod slot;
mod state;

pub use manager::{ManagerOptions, TunnelManager, TunnelSource, DEFAULT_STOP_TIMEOUT};
pub use slot::ResolutionSlot;
pub use state::{TunnelAttempt, TunnelError, TunnelEvent, TunnelState, TunnelStatus};
