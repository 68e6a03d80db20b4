//! GPU command channel scheduling for Strato.
//!
//! This crate multiplexes any number of command-list-producing channels
//! onto one execution context:
//!
//! - **Gpu**: the channel registry and dispatch target. Command lists
//!   reach an installed [`CommandProcessor`] tagged with the currently
//!   bound channel.
//! - **DmaPusher**: per-channel command intake; `dispatch_calls` drains
//!   submitted lists into the GPU.
//! - **Scheduler**: a cooperative, priority-driven selector that runs each
//!   channel on its own stackful fiber. Higher priority values run first;
//!   equal-priority channels rotate via per-channel scheduling counters.
//!
//! Producer threads call [`Scheduler::push`]; the host driver thread calls
//! [`Scheduler::resume`] to drain all runnable channels.

pub mod control;
pub mod dma_pusher;
pub mod gpu;

pub use control::channel_state::ChannelState;
pub use control::scheduler::Scheduler;
pub use dma_pusher::{CommandList, DmaPusher};
pub use gpu::{CommandProcessor, Gpu, NullCommandProcessor};
