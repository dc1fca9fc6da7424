//! Constants the kernel uses in `si_code` to say why a `SIGTRAP` was delivered. They are
//! deeply nested into the libc, and not available from nix or the rust bindings of the libc.
//!
//! Source: <https://elixir.bootlin.com/linux/v6.13.1/source/include/uapi/asm-generic/siginfo.h#L227>

/// Sent by the kernel from somewhere, an `int3` on x86-64 ends up here
pub const SI_KERNEL: i32 = 0x80;

/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap, a completed single step
pub const TRAP_TRACE: i32 = 0x2;

/// The software breakpoint instruction
pub const INT3_BYTE: u8 = 0xcc;

/// Number of bytes in a machine word
pub const WORD_BYTES: usize = 8;
