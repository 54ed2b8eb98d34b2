//! The parent side of the spawn handshake.
//!
//! Once the grandchild's pid arrives, the parent does the work a process
//! cannot do for itself from inside a new user namespace: writing its
//! uid/gid maps and pinning its namespace files. Only then is the child
//! released towards `exec`.

use nix::unistd::Pid;

use crate::bind;
use crate::error::{Error, Result};
use crate::idmap::{IdMapper, Setgroups};
use crate::namespaces::{Catalog, Kind};
use crate::process::channel::SyncPipe;
use crate::spawn::SpawnPlan;
use crate::syscall::SyscallTable;

pub fn run(
    table: &SyscallTable,
    catalog: &Catalog,
    mapper: &IdMapper,
    pipe_pid: &mut SyncPipe,
    pipe_continue: &mut SyncPipe,
    plan: &SpawnPlan,
) -> Result<Pid> {
    pipe_pid.close_write()?;
    pipe_continue.close_read()?;

    // normalisation already rejected this combination; re-check before
    // touching any /proc file of the child
    if plan.setgroups == Some(Setgroups::Allow) && plan.maproot {
        let _ = pipe_continue.close_write();
        return Err(Error::NamespaceSetting(
            "setgroups 'allow' cannot be combined with maproot".to_string(),
        ));
    }

    let child = match pipe_pid.wait_pid() {
        Ok(pid) => pid,
        Err(err) => {
            let _ = pipe_continue.close_write();
            return Err(err);
        }
    };
    pipe_pid.close_read()?;
    log::debug!("namespace init process has pid {}", child);

    if let Err(err) = configure_child(table, catalog, mapper, plan, child) {
        // let the blocked child observe EOF and abort instead of leaking
        // it in the handshake
        let _ = pipe_continue.close_write();
        return Err(err);
    }

    pipe_continue.send_sync()?;
    pipe_continue.close_write()?;
    Ok(child)
}

fn configure_child(
    table: &SyscallTable,
    catalog: &Catalog,
    mapper: &IdMapper,
    plan: &SpawnPlan,
    child: Pid,
) -> Result<()> {
    if plan.contains(Kind::User) {
        if let Some(setgroups) = plan.setgroups {
            mapper.setgroups_control(setgroups, child)?;
        }
        mapper.write_uid_gid_maps(plan.maproot, &plan.users_map, &plan.groups_map, child)?;
    }

    if let Some(dir) = &plan.ns_bind_dir {
        if plan.contains(Kind::Mount) {
            bind::bind_ns_files(table, catalog, child, &plan.kinds, dir)?;
        }
    }

    Ok(())
}
