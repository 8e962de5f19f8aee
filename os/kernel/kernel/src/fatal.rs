use crate::interrupts::RegisterError;
use kernel_alloc::{PmmError, VmmError};
use kernel_info::memory::PagingMode;
use kernel_sched::SchedError;
use kernel_sync::Reentered;

/// A condition the kernel cannot continue from.
///
/// Returned instead of halting in place; [`Kernel::halt`](crate::Kernel::halt)
/// is the only place one is acted upon.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Fatal {
    #[error(transparent)]
    Pmm(#[from] PmmError),
    #[error(transparent)]
    Vmm(#[from] VmmError),
    #[error(transparent)]
    Sched(#[from] SchedError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error("unhandled interrupt {vector} (error code {error:#x}) at {rip:#x}")]
    UnhandledInterrupt { vector: u64, error: u64, rip: u64 },
    /// Memory state was entered from an interrupt while already in use.
    #[error("memory manager re-entered")]
    Reentrant,
    #[error("memory manager used before initialization")]
    NotInitialized,
    #[error("{0:?} paging is not supported on this platform")]
    UnsupportedPaging(PagingMode),
    #[error("physical memory is mapped at {found:#x}, expected {expected:#x}")]
    DirectMapMismatch { found: u64, expected: u64 },
}

impl From<Reentered> for Fatal {
    fn from(_: Reentered) -> Self {
        Self::Reentrant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::{PageFaultError, VirtualAddress};

    #[test]
    fn lower_errors_keep_their_message() {
        let fatal = Fatal::from(VmmError::from(PmmError::OutOfPhysicalMemory));
        assert_eq!(fatal.to_string(), "out of physical memory");

        let fault = Fatal::from(VmmError::UnhandledPageFault {
            address: VirtualAddress::new(0xE000_0000),
            error: PageFaultError::from_bits(0),
        });
        assert!(fault.to_string().starts_with("unhandled page fault at"));
    }

    #[test]
    fn interrupts_are_reported_in_hex() {
        let fatal = Fatal::UnhandledInterrupt {
            vector: 6,
            error: 0,
            rip: 0xFFFF_8000_0010_2000,
        };
        assert_eq!(
            fatal.to_string(),
            "unhandled interrupt 6 (error code 0x0) at 0xffff800000102000"
        );
    }
}
