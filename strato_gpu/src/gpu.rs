//! Channel registry and command dispatch target.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::control::channel_state::ChannelState;
use crate::dma_pusher::{CommandList, DmaPusher};

/// Consumer of dispatched command lists.
///
/// `process` runs on the dispatching channel's fiber and may re-enter
/// scheduler entry points (`push`, `yield_channel`, `check_status`) from
/// arbitrary depth.
pub trait CommandProcessor: Send + Sync {
    /// Consume a command list dispatched on `channel_id`.
    fn process(&self, channel_id: i32, entries: &CommandList);
}

/// Discards everything; the default until an execution backend is attached.
#[derive(Debug, Default)]
pub struct NullCommandProcessor;

impl CommandProcessor for NullCommandProcessor {
    fn process(&self, _channel_id: i32, _entries: &CommandList) {}
}

const NO_CHANNEL: i32 = -1;

/// The shared GPU context channels dispatch into.
pub struct Gpu {
    /// Registered channels by bind id.
    channels: DashMap<i32, Arc<ChannelState>>,
    next_channel_id: AtomicI32,
    /// The channel currently bound for dispatch, or [`NO_CHANNEL`].
    bound_channel: AtomicI32,
    processor: RwLock<Arc<dyn CommandProcessor>>,
}

impl Gpu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            next_channel_id: AtomicI32::new(0),
            bound_channel: AtomicI32::new(NO_CHANNEL),
            processor: RwLock::new(Arc::new(NullCommandProcessor)),
        })
    }

    /// Install the command processor dispatched lists are fed to.
    pub fn set_command_processor(&self, processor: Arc<dyn CommandProcessor>) {
        *self.processor.write() = processor;
    }

    /// Allocate a channel with a fresh bind id at the given priority.
    pub fn create_channel(self: &Arc<Self>, priority: u32) -> Arc<ChannelState> {
        let bind_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ChannelState::new(
            bind_id,
            priority,
            DmaPusher::new(Arc::clone(self)),
        ));
        self.channels.insert(bind_id, Arc::clone(&state));
        state
    }

    /// Look up a registered channel.
    pub fn channel(&self, channel_id: i32) -> Option<Arc<ChannelState>> {
        self.channels.get(&channel_id).map(|entry| Arc::clone(&entry))
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Mark `channel_id` as the source of subsequent dispatches.
    pub fn bind_channel(&self, channel_id: i32) {
        self.bound_channel.store(channel_id, Ordering::Release);
    }

    /// The currently bound channel, if any.
    pub fn bound_channel(&self) -> Option<i32> {
        match self.bound_channel.load(Ordering::Acquire) {
            NO_CHANNEL => None,
            id => Some(id),
        }
    }

    pub(crate) fn process_command_list(&self, entries: &CommandList) {
        let channel_id = self.bound_channel.load(Ordering::Acquire);
        debug_assert!(channel_id != NO_CHANNEL, "dispatch with no bound channel");
        // Clone out so a processor swap never blocks behind dispatch.
        let processor = Arc::clone(&*self.processor.read());
        processor.process(channel_id, entries);
    }
}
