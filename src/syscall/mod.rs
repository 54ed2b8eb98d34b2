//! A uniform wrapping layer over the namespace-related C library
//! functions, with syscall-number fallback when a direct symbol is
//! absent from the process's C library.

mod registry;

pub use registry::{Arg, Op, SyscallTable, HOST_NAME_MAX};
