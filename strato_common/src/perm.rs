//! Guest-visible memory permissions.

use bitflags::bitflags;

bitflags! {
    /// Permission bits carried by a mapped guest range.
    ///
    /// An empty set means the range is reserved but inaccessible.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u32 {
        /// The range may be read.
        const READ = 1 << 0;
        /// The range may be written.
        const WRITE = 1 << 1;
        /// The range may be executed.
        const EXECUTE = 1 << 2;
    }
}

impl MemoryPermission {
    /// Read-write, the permission most heap mappings carry.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Host protection flags for `mmap`/`mprotect`.
    pub(crate) fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_permission_is_prot_none() {
        assert_eq!(MemoryPermission::empty().to_prot(), libc::PROT_NONE);
    }

    #[test]
    fn test_read_write_prot_bits() {
        let prot = MemoryPermission::READ_WRITE.to_prot();
        assert_eq!(prot, libc::PROT_READ | libc::PROT_WRITE);
    }

    #[test]
    fn test_execute_prot_bit() {
        let prot = (MemoryPermission::READ | MemoryPermission::EXECUTE).to_prot();
        assert_eq!(prot, libc::PROT_READ | libc::PROT_EXEC);
    }
}
