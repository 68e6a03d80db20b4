//! Process-wide fault dispatch for the heap tracker.
//!
//! Installing the handler routes SIGSEGV (and SIGBUS on macOS) into
//! [`HeapTracker::handle_fault`]. A claimed fault returns straight out of
//! the handler and the faulting instruction retries against the freshly
//! installed pages. Unclaimed faults are chained to whatever handler was
//! registered before ours, so guard-page detection and crash reporters
//! keep working.
//!
//! Installation is once per process; the tracker registered here stays
//! reachable from signal context for as long as the handler is installed.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, OnceLock};

use crate::heap_tracker::HeapTracker;

/// Error type for fault handler installation.
#[derive(Debug, Clone)]
pub enum FaultHandlerError {
    /// A handler is already installed.
    AlreadyInstalled,
    /// No handler is installed.
    NotInstalled,
    /// The `sigaction` call failed.
    InstallFailed(String),
}

impl std::fmt::Display for FaultHandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultHandlerError::AlreadyInstalled => write!(f, "fault handler already installed"),
            FaultHandlerError::NotInstalled => write!(f, "fault handler not installed"),
            FaultHandlerError::InstallFailed(msg) => {
                write!(f, "fault handler install failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for FaultHandlerError {}

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Tracker consulted from signal context. Holds a leaked `Arc` reference
/// while installed.
static TRACKER: AtomicPtr<HeapTracker> = AtomicPtr::new(ptr::null_mut());

/// The disposition that was active before installation; unclaimed faults
/// chain to it.
static PREVIOUS_ACTION: OnceLock<libc::sigaction> = OnceLock::new();

/// Install the process fault handler, routing faults to `tracker`.
pub fn install_fault_handler(tracker: Arc<HeapTracker>) -> Result<(), FaultHandlerError> {
    if HANDLER_INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(FaultHandlerError::AlreadyInstalled);
    }

    TRACKER.store(Arc::into_raw(tracker) as *mut HeapTracker, Ordering::Release);

    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);

        let mut previous: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &action, &mut previous) != 0 {
            release_tracker();
            HANDLER_INSTALLED.store(false, Ordering::Release);
            return Err(FaultHandlerError::InstallFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let _ = PREVIOUS_ACTION.set(previous);

        // Accesses to just-unmapped pages surface as SIGBUS on macOS.
        #[cfg(target_os = "macos")]
        libc::sigaction(libc::SIGBUS, &action, ptr::null_mut());
    }

    Ok(())
}

/// Remove the fault handler, restoring the previous disposition.
pub fn uninstall_fault_handler() -> Result<(), FaultHandlerError> {
    if !HANDLER_INSTALLED.swap(false, Ordering::AcqRel) {
        return Err(FaultHandlerError::NotInstalled);
    }

    if let Some(previous) = PREVIOUS_ACTION.get() {
        unsafe {
            libc::sigaction(libc::SIGSEGV, previous, ptr::null_mut());
            #[cfg(target_os = "macos")]
            libc::sigaction(libc::SIGBUS, previous, ptr::null_mut());
        }
    }

    release_tracker();
    Ok(())
}

fn release_tracker() {
    let old = TRACKER.swap(ptr::null_mut(), Ordering::AcqRel);
    if !old.is_null() {
        unsafe { drop(Arc::from_raw(old)) };
    }
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> *const u8 {
    unsafe { (*info).si_addr() as *const u8 }
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> *const u8 {
    unsafe { (*info).si_addr as *const u8 }
}

extern "C" fn fault_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let address = unsafe { fault_address(info) };

    let tracker = TRACKER.load(Ordering::Acquire);
    if !tracker.is_null() && unsafe { (*tracker).handle_fault(address) } {
        // Pages are installed; returning retries the faulting instruction.
        return;
    }

    unsafe { chain_previous(sig, info, context) };
}

/// Forward an unclaimed fault to the previously installed handler.
unsafe fn chain_previous(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let Some(previous) = PREVIOUS_ACTION.get() else {
        // Nothing saved: fall back to the default disposition.
        unsafe { reset_to_default(sig) };
        return;
    };

    let handler = previous.sa_sigaction;
    if handler == libc::SIG_DFL {
        // Reinstall the default and return; the instruction re-faults and
        // the default disposition takes over.
        unsafe {
            libc::sigaction(sig, previous, ptr::null_mut());
        }
        return;
    }
    if handler == libc::SIG_IGN {
        return;
    }

    if (previous.sa_flags & libc::SA_SIGINFO) != 0 {
        let chained: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { mem::transmute(handler) };
        chained(sig, info, context);
    } else {
        let chained: extern "C" fn(libc::c_int) = unsafe { mem::transmute(handler) };
        chained(sig);
    }
}

unsafe fn reset_to_default(sig: libc::c_int) {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &action, ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninstall_without_install_fails() {
        // Runs before any install in this process unless the integration
        // suite installed first; either way the double-uninstall must fail.
        let _ = uninstall_fault_handler();
        assert!(matches!(
            uninstall_fault_handler(),
            Err(FaultHandlerError::NotInstalled)
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            FaultHandlerError::AlreadyInstalled.to_string(),
            "fault handler already installed"
        );
        assert_eq!(
            FaultHandlerError::NotInstalled.to_string(),
            "fault handler not installed"
        );
    }
}
