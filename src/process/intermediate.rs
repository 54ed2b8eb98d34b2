//! The intermediate process: first child of the caller.
//!
//! It detaches into the requested namespaces, forks the grandchild that
//! will exec the payload, and relays the grandchild's pid and the
//! handshake bytes between the grandchild and the parent. Keeping this
//! process between the two decouples "the pid exists" from "the child has
//! exec'd".

use std::process;

use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult};

use crate::error::Result;
use crate::process::channel::SyncPipe;
use crate::process::init;
use crate::spawn::SpawnPlan;
use crate::syscall::SyscallTable;

pub fn run(
    table: &SyscallTable,
    pipe_pid: &mut SyncPipe,
    pipe_continue: &mut SyncPipe,
    plan: &SpawnPlan,
) -> Result<()> {
    pipe_pid.close_read()?;
    pipe_continue.close_write()?;

    table.unshare(plan.flags.bits())?;

    let mut pipe_mounted = SyncPipe::new()?;
    let mut pipe_exec = SyncPipe::new()?;

    match unsafe { unistd::fork()? } {
        ForkResult::Child => {
            let code = match init::run(
                table,
                pipe_pid,
                pipe_continue,
                &mut pipe_mounted,
                &mut pipe_exec,
                plan,
            ) {
                Ok(()) => 0,
                Err(err) => {
                    log::debug!("namespace init process failed: {}", err);
                    1
                }
            };
            process::exit(code);
        }
        ForkResult::Parent { child } => {
            pipe_mounted.close_write()?;
            pipe_exec.close_read()?;

            pipe_mounted.wait_sync()?;
            pipe_mounted.close_read()?;

            pipe_pid.send_pid(child)?;
            pipe_pid.close_write()?;

            pipe_continue.wait_sync()?;
            pipe_continue.close_read()?;

            pipe_exec.send_sync()?;
            pipe_exec.close_write()?;

            waitpid(child, None)?;
            Ok(())
        }
    }
}
