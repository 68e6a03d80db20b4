//! Stackful cooperative fibers.
//!
//! A `Fiber` is a full call stack that runs only when control is
//! explicitly transferred into it. `yield_to(from, to)` has exactly-once
//! semantics: `to` starts (or resumes) running and the calling fiber
//! blocks until some other fiber transfers back into it. At most one fiber
//! of a set runs at any instant.
//!
//! Each fiber is carried by a dedicated OS thread parked on a single-slot
//! condvar hand-off; the transfer cost is one wake plus one park. Callers
//! that recursively re-enter scheduling code from arbitrary stack depth
//! (the reason fibers exist here) work unchanged, since every fiber keeps
//! its own stack.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;

/// A stackful coroutine with explicit control transfer.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
}

struct FiberInner {
    /// Set when this fiber has been transferred into and may run.
    runnable: Mutex<bool>,
    wakeup: Condvar,
}

impl FiberInner {
    fn new() -> Self {
        Self {
            runnable: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut runnable = self.runnable.lock();
        debug_assert!(!*runnable, "fiber transferred into twice without running");
        *runnable = true;
        self.wakeup.notify_one();
    }

    fn wait(&self) {
        let mut runnable = self.runnable.lock();
        while !*runnable {
            self.wakeup.wait(&mut runnable);
        }
        *runnable = false;
    }
}

impl Fiber {
    /// Promote the calling OS thread to a fiber.
    ///
    /// The returned fiber is considered running; it blocks the first time
    /// control is transferred away from it.
    pub fn thread_to_fiber() -> Fiber {
        Fiber {
            inner: Arc::new(FiberInner::new()),
        }
    }

    /// Create a suspended fiber that runs `entry` on first transfer.
    ///
    /// `entry` must not return while the fiber can still be transferred
    /// into; a transfer into a finished fiber blocks the caller forever.
    pub fn new(entry: impl FnOnce() + Send + 'static) -> Fiber {
        let inner = Arc::new(FiberInner::new());
        let fiber_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("strato-fiber".into())
            .spawn(move || {
                // Park until the first transfer in.
                fiber_inner.wait();
                entry();
            })
            .expect("failed to spawn fiber thread");
        Fiber { inner }
    }

    /// Transfer control from `from` to `to`.
    ///
    /// `from` must be the fiber the caller is currently running on. The
    /// call returns when another fiber transfers back into `from`.
    pub fn yield_to(from: &Fiber, to: &Fiber) {
        to.inner.signal();
        from.inner.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    #[test]
    fn test_ping_pong_transfer() {
        let master = Fiber::thread_to_fiber();
        let log = Arc::new(Mutex::new(Vec::new()));

        let worker_cell: Arc<OnceLock<Fiber>> = Arc::new(OnceLock::new());
        let worker = {
            let master = master.clone();
            let log = Arc::clone(&log);
            let worker_cell = Arc::clone(&worker_cell);
            Fiber::new(move || {
                let me = worker_cell.get().expect("worker fiber not registered");
                loop {
                    log.lock().push("worker");
                    Fiber::yield_to(me, &master);
                }
            })
        };
        let _ = worker_cell.set(worker.clone());

        log.lock().push("master");
        Fiber::yield_to(&master, &worker);
        log.lock().push("master");
        Fiber::yield_to(&master, &worker);

        assert_eq!(*log.lock(), ["master", "worker", "master", "worker"]);
    }

    #[test]
    fn test_transfer_chain_through_two_fibers() {
        // master -> a -> b -> master, driven twice.
        let master = Fiber::thread_to_fiber();
        let counter = Arc::new(Mutex::new(0u32));

        let b_cell: Arc<OnceLock<Fiber>> = Arc::new(OnceLock::new());
        let b = {
            let master = master.clone();
            let counter = Arc::clone(&counter);
            let b_cell = Arc::clone(&b_cell);
            Fiber::new(move || {
                let me = b_cell.get().expect("b not registered");
                loop {
                    *counter.lock() += 10;
                    Fiber::yield_to(me, &master);
                }
            })
        };
        let _ = b_cell.set(b.clone());

        let a_cell: Arc<OnceLock<Fiber>> = Arc::new(OnceLock::new());
        let a = {
            let b = b.clone();
            let counter = Arc::clone(&counter);
            let a_cell = Arc::clone(&a_cell);
            Fiber::new(move || {
                let me = a_cell.get().expect("a not registered");
                loop {
                    *counter.lock() += 1;
                    Fiber::yield_to(me, &b);
                }
            })
        };
        let _ = a_cell.set(a.clone());

        Fiber::yield_to(&master, &a);
        assert_eq!(*counter.lock(), 11);
        Fiber::yield_to(&master, &a);
        assert_eq!(*counter.lock(), 22);
    }
}
