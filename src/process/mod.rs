//! The spawn coordinator: a three-generation pipeline of parent,
//! intermediate and grandchild, synchronised over one-byte pipes.
//!
//! ```text
//! parent ── pipe_pid / pipe_continue ── intermediate
//!                                        │ unshare(flags)
//!                                        └─ fork ── grandchild
//!                                             pipe_mounted / pipe_exec
//! ```
//!
//! The ordering the pipes enforce, per spawn: the grandchild's mount
//! mutations happen before the parent writes identity maps, which happens
//! before the grandchild execs.

pub mod channel;
mod init;
mod intermediate;
mod parent;

use std::process;
use std::sync::Mutex;

use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid};
use once_cell::sync::Lazy;

use crate::error::Result;
use crate::idmap::IdMapper;
use crate::namespaces::Catalog;
use crate::spawn::SpawnPlan;
use crate::syscall::SyscallTable;
use self::channel::SyncPipe;

/// Pids of intermediate processes that still need reaping at exit.
static SPAWNED: Lazy<Mutex<Vec<libc::pid_t>>> = Lazy::new(|| Mutex::new(Vec::new()));
static REAPER: std::sync::Once = std::sync::Once::new();

extern "C" fn reap_spawned() {
    if let Ok(mut pids) = SPAWNED.lock() {
        for pid in pids.drain(..) {
            // ECHILD just means somebody else already collected it
            let _ = waitpid(Pid::from_raw(pid), None);
        }
    }
}

fn reap_at_exit(pid: Pid) {
    REAPER.call_once(|| unsafe {
        libc::atexit(reap_spawned);
    });
    if let Ok(mut pids) = SPAWNED.lock() {
        pids.push(pid.as_raw());
    }
}

/// Fork the intermediate process and run the parent side of the
/// handshake. Returns once the new domain is fully configured and the
/// grandchild has been released towards `exec`.
pub(crate) fn spawn(
    table: &SyscallTable,
    catalog: &Catalog,
    mapper: &IdMapper,
    plan: &SpawnPlan,
) -> Result<()> {
    let mut pipe_pid = SyncPipe::new()?;
    let mut pipe_continue = SyncPipe::new()?;

    match unsafe { unistd::fork()? } {
        ForkResult::Child => {
            let code = match intermediate::run(table, &mut pipe_pid, &mut pipe_continue, plan) {
                Ok(()) => 0,
                Err(err) => {
                    log::debug!("namespace intermediate process failed: {}", err);
                    1
                }
            };
            process::exit(code);
        }
        ForkResult::Parent { child } => {
            let result = parent::run(
                table,
                catalog,
                mapper,
                &mut pipe_pid,
                &mut pipe_continue,
                plan,
            );
            reap_at_exit(child);
            result.map(drop)
        }
    }
}
