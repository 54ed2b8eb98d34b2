//! procszoo is a low-level toolkit for creating and manipulating Linux
//! kernel namespaces, the primitive building blocks of container
//! runtimes.
//!
//! The core operation spawns a child process inside a chosen combination
//! of namespaces, cooperatively configures its identity mappings and
//! mount propagation from the parent, optionally pins the namespace files
//! to a directory, and execs a payload as init of the new domain:
//!
//! ```no_run
//! use procszoo::SpawnRequest;
//!
//! SpawnRequest::new()
//!     .namespaces(vec!["uts", "pid", "mount", "user"])
//!     .nscmd(vec!["/bin/sh"])
//!     .spawn()
//!     .unwrap();
//! ```
//!
//! Everything is also reachable through [`workbench()`], the process-wide
//! facade instance the free functions below delegate to.

pub mod bind;
pub mod error;
pub mod idmap;
pub mod mount;
pub mod namespaces;
pub mod process;
pub mod spawn;
pub mod syscall;
pub mod workbench;

use std::path::Path;

pub use crate::error::{Error, Result};
pub use crate::idmap::Setgroups;
pub use crate::mount::{Propagation, UmountBehavior};
pub use crate::namespaces::Kind;
pub use crate::spawn::SpawnRequest;
pub use crate::workbench::{workbench, SetnsRequest, Workbench};

/// Probe the kernel once for the supported namespace kinds.
pub fn check_namespaces_available_status() -> Result<()> {
    workbench().check_namespaces_available_status()
}

/// `(kind, available)` pairs in catalog order.
pub fn show_namespaces_status() -> Result<Vec<(Kind, bool)>> {
    workbench().show_namespaces_status()
}

/// Whether the running kernel admits the given namespace kind.
pub fn namespace_available(kind: Kind) -> bool {
    workbench().namespace_available(kind)
}

/// Names of the wrapped C functions that resolved on this system.
pub fn show_available_c_functions() -> Vec<&'static str> {
    workbench().show_available_c_functions()
}

pub fn adjust_namespaces(
    include: Option<&[&str]>,
    exclude: Option<&[&str]>,
) -> Result<Vec<Kind>> {
    workbench().adjust_namespaces(include, exclude)
}

/// Detach the calling process from the named namespaces.
pub fn unshare(namespaces: &[&str]) -> Result<()> {
    workbench().unshare(namespaces)
}

/// Attach the calling process to an existing namespace.
pub fn setns(request: SetnsRequest) -> Result<()> {
    workbench().setns(request)
}

/// Spawn a child inside new namespaces; see [`SpawnRequest`].
pub fn spawn_namespaces(request: &SpawnRequest) -> Result<()> {
    workbench().spawn_namespaces(request)
}

pub fn mount(
    source: Option<&str>,
    target: Option<&Path>,
    propagation: Option<Propagation>,
    fstype: Option<&str>,
    data: Option<&str>,
) -> Result<()> {
    workbench().mount(source, target, propagation, fstype, data)
}

pub fn umount(mountpoint: &Path) -> Result<()> {
    workbench().umount(mountpoint)
}

pub fn umount2(mountpoint: &Path, behavior: UmountBehavior) -> Result<()> {
    workbench().umount2(mountpoint, behavior)
}

/// Change the propagation of `/` inside the current mount namespace.
pub fn set_propagation(propagation: Propagation) -> Result<()> {
    workbench().set_propagation(propagation)
}

/// Mount a fresh proc filesystem at `mountpoint`.
pub fn mount_proc(mountpoint: &Path) -> Result<()> {
    workbench().mount_proc(mountpoint)
}

pub fn pivot_root(new_root: &Path, put_old: &Path) -> Result<()> {
    workbench().pivot_root(new_root, put_old)
}

pub fn gethostname() -> Result<String> {
    workbench().gethostname()
}

pub fn sethostname(hostname: &str) -> Result<()> {
    workbench().sethostname(hostname)
}

pub fn getdomainname() -> Result<String> {
    workbench().getdomainname()
}

pub fn setdomainname(domainname: &str) -> Result<()> {
    workbench().setdomainname(domainname)
}

pub fn sched_getcpu() -> Result<i32> {
    workbench().sched_getcpu()
}

/// Register process-wide fork handlers; see `pthread_atfork(3)`. Handlers
/// must not take locks another thread might hold at fork time.
pub fn atfork(
    prepare: Option<extern "C" fn()>,
    parent: Option<extern "C" fn()>,
    child: Option<extern "C" fn()>,
) -> Result<()> {
    workbench().atfork(prepare, parent, child)
}
