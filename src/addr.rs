//! # Address Module
//!
//! Provides the [`Addr`] newtype used for every tracee address in the debugger: program
//! counters, line-table addresses, FDE ranges and memory peeks.
//!
//! Addresses are stored as [`u64`] since the debugger only targets x86-64.

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Raw pointer form of an address, as `ptrace` wants it
pub type RawPointer = *mut std::ffi::c_void;

/// An address in the address space of the debuggee
#[derive(Hash, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Addr(u64);

impl Addr {
    /// The null address
    pub const NULL: Addr = Addr(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn u64(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn usize(&self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub fn raw_pointer(&self) -> RawPointer {
        self.0 as usize as RawPointer
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Offsets the address by a signed amount, wrapping like the CPU would
    #[must_use]
    pub const fn offset(&self, delta: i64) -> Self {
        Self(self.0.wrapping_add_signed(delta))
    }

    /// Adds `rhs`, `None` if the sum does not fit into 64 bits
    #[must_use]
    pub const fn checked_add(&self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(sum) => Some(Self(sum)),
            None => None,
        }
    }

    #[must_use]
    pub fn checked_sub(&self, rhs: u64) -> Option<Self> {
        self.0.checked_sub(rhs).map(Self)
    }

    /// Distance in bytes from `base` to this address, if this address is not below `base`
    #[must_use]
    pub fn distance_from(&self, base: Addr) -> Option<usize> {
        self.0.checked_sub(base.0).map(|d| d as usize)
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

// Plain arithmetic wraps like the CPU would, values read from a binary go through
// `checked_add` instead.
impl Add<u64> for Addr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Add<usize> for Addr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0.wrapping_add(rhs as u64))
    }
}

impl AddAssign<u64> for Addr {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl AddAssign<usize> for Addr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 = self.0.wrapping_add(rhs as u64);
    }
}

impl Sub<u64> for Addr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl Sub<usize> for Addr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0.wrapping_sub(rhs as u64))
    }
}

impl SubAssign<u64> for Addr {
    fn sub_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value)
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Addr(value as u64)
    }
}

impl From<Addr> for u64 {
    fn from(value: Addr) -> Self {
        value.0
    }
}

impl From<Addr> for RawPointer {
    fn from(value: Addr) -> Self {
        value.raw_pointer()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_addr_arithmetic() {
        let a = Addr::from(0x1000u64);
        assert_eq!((a + 0x10u64).u64(), 0x1010);
        assert_eq!((a - 1usize).u64(), 0xfff);
        assert_eq!(a.offset(-16).u64(), 0xff0);
        assert_eq!(a.offset(16).u64(), 0x1010);
        assert_eq!(Addr::from(3u64).checked_sub(4), None);
        assert_eq!(a.checked_add(8), Some(Addr::from(0x1008u64)));
        assert_eq!(Addr::from(u64::MAX - 1).checked_add(2), None);
        assert_eq!(Addr::from(u64::MAX) + 2u64, Addr::from(1u64));
        assert_eq!(Addr::from(0x1008u64).distance_from(a), Some(8));
        assert_eq!(a.distance_from(Addr::from(0x1008u64)), None);
    }

    #[test]
    fn test_addr_formatting() {
        let a = Addr::from(0x401136u64);
        assert_eq!(format!("{a}"), "0x0000000000401136");
        assert_eq!(format!("{a:x}"), "401136");
        assert!(Addr::NULL.is_null());
    }
}
