//! Per-channel state shared between producers and the scheduler.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::dma_pusher::DmaPusher;

/// State owned by one GPU channel.
pub struct ChannelState {
    /// The channel's bind id, unique per GPU.
    pub bind_id: i32,
    /// Scheduling priority; numerically greater runs first. Written only
    /// by the scheduler under its guard.
    priority: AtomicU32,
    /// Command intake for this channel.
    pub dma_pusher: DmaPusher,
}

impl ChannelState {
    pub(crate) fn new(bind_id: i32, priority: u32, dma_pusher: DmaPusher) -> Self {
        Self {
            bind_id,
            priority: AtomicU32::new(priority),
            dma_pusher,
        }
    }

    /// Current scheduling priority.
    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Release);
    }
}
