//! Cooperative priority scheduling of channel fibers.
//!
//! Each declared channel gets a fifo record and a fiber whose entry point
//! is [`Scheduler::channel_loop`]. The host driver thread becomes the
//! master fiber via [`Scheduler::init`]; [`Scheduler::resume`] then
//! repeatedly selects the highest-priority runnable channel and transfers
//! into it, until nothing is runnable.
//!
//! Selection walks priority levels from highest to lowest. Within a level,
//! the channel with the smallest `scheduled_count` wins, which rotates
//! equal-priority channels fairly; a channel that explicitly yielded is
//! passed over until its yield bias is consumed.
//!
//! # Locking
//!
//! `state` (the scheduling guard) protects the priority queue, the fifo
//! table, and the reschedule flag; each fifo's own guard protects its work
//! queue and counters. The guard order is scheduling guard first, then
//! fifo guard, and no fiber transfer ever happens while either is held.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, OnceLock};

use strato_common::Fiber;

use crate::control::channel_state::ChannelState;
use crate::dma_pusher::CommandList;
use crate::gpu::Gpu;

/// The scheduler's record for one channel.
struct GpFifo {
    bind_id: i32,
    info: Arc<ChannelState>,
    fiber: Fiber,
    /// The channel guard.
    state: Mutex<FifoState>,
}

#[derive(Default)]
struct FifoState {
    pending_work: VecDeque<CommandList>,
    /// Set while a command list is in flight in the DMA pusher.
    is_running: bool,
    /// Times this channel has been selected; the fairness key.
    scheduled_count: u64,
    /// Watermark set by an explicit yield; selection passes the channel
    /// over while `scheduled_count` is below it.
    yield_count: u64,
}

impl FifoState {
    #[inline]
    fn is_runnable(&self) -> bool {
        !self.pending_work.is_empty() || self.is_running
    }
}

struct SchedulerState {
    /// Channel ids per priority level; iterated from the highest level.
    priority_queue: BTreeMap<u32, VecDeque<usize>>,
    channel_fifo_ids: FxHashMap<i32, usize>,
    fifos: Vec<Option<Arc<GpFifo>>>,
    free_fifos: VecDeque<usize>,
    /// The selected channel, set between selection and transfer and while
    /// its fiber runs.
    current_fifo: Option<usize>,
    /// Set when a push outranks the running channel; consumed by the next
    /// selection.
    must_reschedule: bool,
}

/// Cooperative priority scheduler multiplexing channels onto one context.
pub struct Scheduler {
    gpu: Arc<Gpu>,
    master_control: OnceLock<Fiber>,
    /// The scheduling guard.
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(gpu: Arc<Gpu>) -> Self {
        Self {
            gpu,
            master_control: OnceLock::new(),
            state: Mutex::new(SchedulerState {
                priority_queue: BTreeMap::new(),
                channel_fifo_ids: FxHashMap::default(),
                fifos: Vec::new(),
                free_fifos: VecDeque::new(),
                current_fifo: None,
                must_reschedule: false,
            }),
        }
    }

    /// Promote the calling thread to the master fiber. Must run on the
    /// host driver thread before `resume`, exactly once.
    pub fn init(&self) {
        if self.master_control.set(Fiber::thread_to_fiber()).is_err() {
            panic!("scheduler already initialized");
        }
    }

    fn master(&self) -> &Fiber {
        self.master_control.get().expect("scheduler not initialized")
    }

    /// Register a channel and create its fiber.
    ///
    /// The channel becomes selectable at its current priority; its fiber
    /// first runs when `resume` picks it.
    pub fn declare_channel(self: &Arc<Self>, channel: Arc<ChannelState>) {
        let channel_id = channel.bind_id;
        let mut sched = self.state.lock();

        let fifo_id = match sched.free_fifos.pop_front() {
            Some(id) => id,
            None => {
                sched.fifos.push(None);
                sched.fifos.len() - 1
            }
        };

        let this = Arc::clone(self);
        let fiber = Fiber::new(move || this.channel_loop(fifo_id, channel_id));

        sched.fifos[fifo_id] = Some(Arc::new(GpFifo {
            bind_id: channel_id,
            info: Arc::clone(&channel),
            fiber,
            state: Mutex::new(FifoState::default()),
        }));
        sched.channel_fifo_ids.insert(channel_id, fifo_id);
        sched
            .priority_queue
            .entry(channel.priority())
            .or_default()
            .push_back(fifo_id);
    }

    /// Queue a command list on a declared channel.
    ///
    /// May be called from any producer thread, and from inside a dispatch.
    /// Pushing work that outranks the running channel flags a reschedule,
    /// picked up at that channel's next `check_status`.
    pub fn push(&self, channel_id: i32, entries: CommandList) {
        let mut sched = self.state.lock();
        let &fifo_id = sched
            .channel_fifo_ids
            .get(&channel_id)
            .expect("push to undeclared channel");
        let fifo = Arc::clone(sched.fifos[fifo_id].as_ref().expect("fifo table corrupt"));

        {
            let mut fifo_state = fifo.state.lock();
            fifo_state.pending_work.push_back(entries);
        }

        if let Some(current) = sched.current_fifo {
            let running = sched.fifos[current].as_ref().expect("fifo table corrupt");
            if running.info.priority() < fifo.info.priority() {
                sched.must_reschedule = true;
            }
        }
    }

    /// Move a channel to a new priority level.
    ///
    /// Unknown channels are ignored. The move is atomic under the
    /// scheduling guard: the next selection sees the channel only at the
    /// new level.
    pub fn change_priority(&self, channel_id: i32, new_priority: u32) {
        let mut sched = self.state.lock();
        let Some(&fifo_id) = sched.channel_fifo_ids.get(&channel_id) else {
            return;
        };
        let fifo = Arc::clone(sched.fifos[fifo_id].as_ref().expect("fifo table corrupt"));

        let old_priority = fifo.info.priority();
        if old_priority == new_priority {
            return;
        }
        fifo.info.set_priority(new_priority);

        sched
            .priority_queue
            .entry(new_priority)
            .or_default()
            .push_back(fifo_id);
        if let Some(queue) = sched.priority_queue.get_mut(&old_priority) {
            queue.retain(|&id| id != fifo_id);
        }
    }

    /// Run channels until nothing is runnable.
    ///
    /// Must be called on the thread that ran `init`. Returns once every
    /// declared channel is idle; call again after new work arrives.
    pub fn resume(&self) {
        loop {
            let fifo = {
                let mut sched = self.state.lock();
                if !Self::update_highest_priority_channel(&mut sched) {
                    break;
                }
                let id = sched.current_fifo.expect("selector reported without selecting");
                Arc::clone(sched.fifos[id].as_ref().expect("fifo table corrupt"))
            };
            fifo.state.lock().scheduled_count += 1;
            Fiber::yield_to(self.master(), &fifo.fiber);
        }
    }

    /// Select the best runnable channel into `current_fifo`.
    fn update_highest_priority_channel(sched: &mut SchedulerState) -> bool {
        sched.must_reschedule = false;
        sched.current_fifo = None;

        let levels: Vec<u32> = sched.priority_queue.keys().rev().copied().collect();
        for level in levels {
            if Self::schedule_level(sched, level) {
                return true;
            }
        }
        false
    }

    /// Pick the least-scheduled runnable channel within one level.
    fn schedule_level(sched: &mut SchedulerState, level: u32) -> bool {
        let Some(queue) = sched.priority_queue.get(&level) else {
            return false;
        };

        let mut min_scheduled = u64::MAX;
        let mut selected = None;
        for &fifo_id in queue {
            let fifo = sched.fifos[fifo_id]
                .as_ref()
                .expect("priority queue references missing fifo");
            let mut fifo_state = fifo.state.lock();
            if !fifo_state.is_runnable() {
                continue;
            }
            if fifo_state.scheduled_count > min_scheduled {
                continue;
            }
            if fifo_state.scheduled_count < fifo_state.yield_count {
                // Consume the yield bias without running the channel.
                fifo_state.scheduled_count += 1;
                continue;
            }
            min_scheduled = fifo_state.scheduled_count;
            selected = Some(fifo_id);
        }

        sched.current_fifo = selected;
        selected.is_some()
    }

    /// Surrender the running channel's slot.
    ///
    /// Called from channel code. Selection will pass this channel over at
    /// least once before running it again; control returns here once it is
    /// next selected.
    pub fn yield_channel(&self) {
        let fifo = {
            let sched = self.state.lock();
            let id = sched.current_fifo.expect("yield outside a channel fiber");
            let fifo = Arc::clone(sched.fifos[id].as_ref().expect("fifo table corrupt"));
            let mut fifo_state = fifo.state.lock();
            fifo_state.yield_count = fifo_state.scheduled_count + 1;
            drop(fifo_state);
            fifo
        };
        Fiber::yield_to(&fifo.fiber, self.master());
        self.gpu.bind_channel(fifo.bind_id);
    }

    /// Give way if a higher-priority push arrived.
    ///
    /// Called from channel code between command lists. No-op unless a
    /// reschedule is pending; otherwise control moves to the master fiber
    /// and returns here once this channel is selected again.
    pub fn check_status(&self) {
        let fifo = {
            let sched = self.state.lock();
            if !sched.must_reschedule {
                return;
            }
            let id = sched.current_fifo.expect("check_status outside a channel fiber");
            Arc::clone(sched.fifos[id].as_ref().expect("fifo table corrupt"))
        };
        Fiber::yield_to(&fifo.fiber, self.master());
        self.gpu.bind_channel(fifo.bind_id);
    }

    /// Whether a reschedule is pending.
    pub fn reschedule_pending(&self) -> bool {
        self.state.lock().must_reschedule
    }

    /// Body of every channel fiber.
    ///
    /// Drains the channel's queue through the DMA pusher, checking for
    /// preemption after each list, then parks on the master fiber until
    /// selected again.
    fn channel_loop(&self, fifo_id: usize, channel_id: i32) {
        self.gpu.bind_channel(channel_id);
        let fifo = {
            let sched = self.state.lock();
            Arc::clone(sched.fifos[fifo_id].as_ref().expect("channel fiber without fifo"))
        };
        loop {
            loop {
                {
                    let mut fifo_state = fifo.state.lock();
                    match fifo_state.pending_work.pop_front() {
                        Some(entries) => {
                            fifo_state.is_running = true;
                            fifo.info.dma_pusher.push(entries);
                        }
                        None => {
                            fifo_state.is_running = false;
                            break;
                        }
                    }
                }
                fifo.info.dma_pusher.dispatch_calls();
                self.check_status();
            }
            Fiber::yield_to(&fifo.fiber, self.master());
            self.gpu.bind_channel(channel_id);
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshot of the priority queue: `(level, bind ids)` from the
    /// highest level down. Levels left empty by priority moves are kept.
    pub fn priority_levels(&self) -> Vec<(u32, Vec<i32>)> {
        let sched = self.state.lock();
        sched
            .priority_queue
            .iter()
            .rev()
            .map(|(&level, queue)| {
                let ids = queue
                    .iter()
                    .map(|&fifo_id| {
                        sched.fifos[fifo_id]
                            .as_ref()
                            .expect("priority queue references missing fifo")
                            .bind_id
                    })
                    .collect();
                (level, ids)
            })
            .collect()
    }
}
