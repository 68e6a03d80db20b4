//! Host backing buffer with a reserved virtual span.
//!
//! `HostMemory` owns two things:
//!
//! - a page-backed **backing allocation** (an anonymous memory file) holding
//!   the guest's physical pages, addressed by host offset, and
//! - a **virtual span** reserved with `PROT_NONE`, addressed by guest
//!   virtual offset, into which backing pages are installed on demand.
//!
//! `map` installs backing pages at a virtual offset with `MAP_FIXED`,
//! `unmap` replaces the range with fresh inaccessible reservation, and
//! `protect` adjusts page protection in place. All offsets and sizes are
//! multiples of the host page size; callers guarantee this.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::perm::MemoryPermission;

// On Linux, ranges at least this large are advised towards transparent huge
// pages when installed. Separate-heap installs skip the advice; they are
// evicted wholesale and rarely stay hot long enough to benefit.
#[cfg(target_os = "linux")]
const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Error type for backing buffer operations.
#[derive(Debug, Clone)]
pub enum HostMemoryError {
    /// Failed to create the backing allocation or reserve the virtual span.
    Allocation(String),
    /// An `mmap`/`mprotect` call on an installed range failed.
    Protection(String),
}

impl std::fmt::Display for HostMemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostMemoryError::Allocation(msg) => {
                write!(f, "host memory allocation failed: {}", msg)
            }
            HostMemoryError::Protection(msg) => {
                write!(f, "host memory protection change failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for HostMemoryError {}

/// A large virtual address range backed by host pages on demand.
pub struct HostMemory {
    /// Anonymous file holding the backing pages.
    backing_fd: OwnedFd,
    /// Size of the backing allocation in bytes.
    backing_size: u64,
    /// Base of the reserved virtual span.
    virtual_base: NonNull<u8>,
    /// Size of the reserved virtual span in bytes.
    virtual_size: u64,
    /// Host page size, cached at construction.
    page_size: u64,
}

// Safety: all mutation goes through the kernel's mapping tables; the struct
// itself is immutable after construction.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Create a backing allocation of `backing_size` bytes and reserve a
    /// `virtual_size`-byte virtual span for it.
    pub fn new(backing_size: u64, virtual_size: u64) -> Result<Self, HostMemoryError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        debug_assert!(backing_size % page_size == 0);
        debug_assert!(virtual_size % page_size == 0);

        let backing_fd = Self::create_backing(backing_size)?;

        // Reserve the span inaccessible; map() punches real pages into it.
        let virtual_base = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                virtual_size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(HostMemoryError::Allocation(
                    io::Error::last_os_error().to_string(),
                ));
            }
            NonNull::new_unchecked(ptr as *mut u8)
        };

        Ok(Self {
            backing_fd,
            backing_size,
            virtual_base,
            virtual_size,
            page_size,
        })
    }

    #[cfg(target_os = "linux")]
    fn create_backing(backing_size: u64) -> Result<OwnedFd, HostMemoryError> {
        unsafe {
            let fd = libc::memfd_create(c"strato-backing".as_ptr(), libc::MFD_CLOEXEC);
            if fd < 0 {
                return Err(HostMemoryError::Allocation(
                    io::Error::last_os_error().to_string(),
                ));
            }
            let fd = OwnedFd::from_raw_fd(fd);
            if libc::ftruncate(fd.as_raw_fd(), backing_size as libc::off_t) != 0 {
                return Err(HostMemoryError::Allocation(
                    io::Error::last_os_error().to_string(),
                ));
            }
            Ok(fd)
        }
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn create_backing(backing_size: u64) -> Result<OwnedFd, HostMemoryError> {
        use std::sync::atomic::{AtomicU64, Ordering};

        static NEXT_NAME: AtomicU64 = AtomicU64::new(0);

        let name = format!(
            "/strato-backing-{}-{}\0",
            std::process::id(),
            NEXT_NAME.fetch_add(1, Ordering::Relaxed)
        );
        unsafe {
            let fd = libc::shm_open(
                name.as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            );
            if fd < 0 {
                return Err(HostMemoryError::Allocation(
                    io::Error::last_os_error().to_string(),
                ));
            }
            // Unlink immediately; the fd keeps the object alive.
            libc::shm_unlink(name.as_ptr() as *const libc::c_char);
            let fd = OwnedFd::from_raw_fd(fd);
            if libc::ftruncate(fd.as_raw_fd(), backing_size as libc::off_t) != 0 {
                return Err(HostMemoryError::Allocation(
                    io::Error::last_os_error().to_string(),
                ));
            }
            Ok(fd)
        }
    }

    /// Install backing pages at `virtual_offset`, reading from
    /// `host_offset` in the backing allocation.
    ///
    /// `separate_heap` marks installs of evictable heap ranges; they skip
    /// huge-page advice since they rarely stay hot long enough to benefit.
    pub fn map(
        &self,
        virtual_offset: u64,
        host_offset: u64,
        size: u64,
        perm: MemoryPermission,
        separate_heap: bool,
    ) -> Result<(), HostMemoryError> {
        self.check_range(virtual_offset, size);
        debug_assert!(host_offset % self.page_size == 0);
        debug_assert!(host_offset + size <= self.backing_size);

        let target = unsafe { self.virtual_base.as_ptr().add(virtual_offset as usize) };
        unsafe {
            let ptr = libc::mmap(
                target as *mut libc::c_void,
                size as usize,
                perm.to_prot(),
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.backing_fd.as_raw_fd(),
                host_offset as libc::off_t,
            );
            if ptr == libc::MAP_FAILED {
                return Err(HostMemoryError::Protection(
                    io::Error::last_os_error().to_string(),
                ));
            }
        }

        #[cfg(target_os = "linux")]
        if !separate_heap && size >= HUGE_PAGE_SIZE {
            unsafe {
                libc::madvise(target as *mut libc::c_void, size as usize, libc::MADV_HUGEPAGE);
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = separate_heap;

        Ok(())
    }

    /// Drop backing pages at `virtual_offset`, restoring the inaccessible
    /// reservation over the range.
    pub fn unmap(
        &self,
        virtual_offset: u64,
        size: u64,
        _separate_heap: bool,
    ) -> Result<(), HostMemoryError> {
        self.check_range(virtual_offset, size);

        let target = unsafe { self.virtual_base.as_ptr().add(virtual_offset as usize) };
        unsafe {
            let ptr = libc::mmap(
                target as *mut libc::c_void,
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(HostMemoryError::Protection(
                    io::Error::last_os_error().to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Change the protection of an installed range.
    pub fn protect(
        &self,
        virtual_offset: u64,
        size: u64,
        perm: MemoryPermission,
    ) -> Result<(), HostMemoryError> {
        self.check_range(virtual_offset, size);

        let target = unsafe { self.virtual_base.as_ptr().add(virtual_offset as usize) };
        let result =
            unsafe { libc::mprotect(target as *mut libc::c_void, size as usize, perm.to_prot()) };
        if result != 0 {
            return Err(HostMemoryError::Protection(
                io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }

    /// Base pointer of the reserved virtual span.
    #[inline]
    pub fn virtual_base_pointer(&self) -> *mut u8 {
        self.virtual_base.as_ptr()
    }

    /// Whether a host pointer falls inside the reserved virtual span.
    #[inline]
    pub fn is_in_virtual_range(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.virtual_base.as_ptr() as usize;
        addr >= base && addr < base + self.virtual_size as usize
    }

    /// Size of the backing allocation in bytes.
    #[inline]
    pub fn backing_size(&self) -> u64 {
        self.backing_size
    }

    /// Size of the reserved virtual span in bytes.
    #[inline]
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// Host page size in bytes.
    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    #[inline]
    fn check_range(&self, virtual_offset: u64, size: u64) {
        debug_assert!(virtual_offset % self.page_size == 0);
        debug_assert!(size % self.page_size == 0);
        debug_assert!(virtual_offset + size <= self.virtual_size);
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.virtual_base.as_ptr() as *mut libc::c_void,
                self.virtual_size as usize,
            );
        }
    }
}
