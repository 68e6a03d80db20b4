//! Command list intake for a single channel.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::gpu::Gpu;

/// A submitted batch of raw command entries.
///
/// Entries are opaque at this layer; interpretation belongs to whatever
/// [`CommandProcessor`](crate::CommandProcessor) is installed on the GPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandList {
    /// Raw command words in submission order.
    pub entries: SmallVec<[u64; 4]>,
}

impl CommandList {
    /// Build a command list from raw entries.
    pub fn new(entries: impl IntoIterator<Item = u64>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Whether the list carries no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries in the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Per-channel DMA pusher.
///
/// The scheduler's channel fiber hands one command list at a time to
/// `push` and then drains it with `dispatch_calls`; dispatch may recurse
/// back into scheduler entry points, which is why callers run it on a
/// fiber with its own stack.
pub struct DmaPusher {
    gpu: Arc<Gpu>,
    dma_pushbuffer: Mutex<VecDeque<CommandList>>,
}

impl DmaPusher {
    pub(crate) fn new(gpu: Arc<Gpu>) -> Self {
        Self {
            gpu,
            dma_pushbuffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a command list for dispatch.
    pub fn push(&self, entries: CommandList) {
        self.dma_pushbuffer.lock().push_back(entries);
    }

    /// Dispatch every queued command list to the GPU, in order.
    pub fn dispatch_calls(&self) {
        loop {
            let Some(entries) = self.dma_pushbuffer.lock().pop_front() else {
                break;
            };
            self.gpu.process_command_list(&entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_list_construction() {
        let list = CommandList::new([1, 2, 3]);
        assert_eq!(list.len(), 3);
        assert!(!list.is_empty());
        assert!(CommandList::default().is_empty());
    }
}
