//! Architecture backends.
//!
//! Only the pieces that actually touch the CPU live here; everything in
//! [`crate::Kernel`] is architecture-neutral and runs hosted in tests.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
