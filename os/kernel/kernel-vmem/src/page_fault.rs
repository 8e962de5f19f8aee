use bitfield_struct::bitfield;

/// Page-fault error code layout.
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultError {
    /// Error code of a supervisor write to a non-present page, the only
    /// fault the kernel resolves.
    pub const SUPERVISOR_WRITE_NOT_PRESENT: Self = Self::new().with_write(true);

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            if self.write() {
                "Write to non-present page"
            } else if self.instruction_fetch() {
                "Instruction fetch from non-present page"
            } else {
                "Read from non-present page"
            }
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_write_is_error_code_two() {
        assert_eq!(PageFaultError::SUPERVISOR_WRITE_NOT_PRESENT.into_bits(), 2);
        assert_eq!(
            PageFaultError::from_bits(2).explain(),
            "Write to non-present page"
        );
    }

    #[test]
    fn protection_violations_are_explained() {
        let e = PageFaultError::new().with_present(true).with_write(true);
        assert_eq!(e.explain(), "Write access to protected page");
        let e = PageFaultError::new().with_present(true);
        assert_eq!(e.explain(), "Read access to protected page");
    }
}
