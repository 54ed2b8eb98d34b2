//! The grandchild: the process that ends up as init of the new domain.
//!
//! It performs the mount-namespace work the parent cannot do, then parks
//! on the handshake pipe until the parent has written identity mappings
//! and pinned namespace files, and finally execs the payload.

use std::env;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use nix::unistd::{self, AccessFlags};

use crate::error::{Error, Result};
use crate::mount;
use crate::namespaces::Kind;
use crate::process::channel::SyncPipe;
use crate::spawn::SpawnPlan;
use crate::syscall::SyscallTable;

/// Runs in the grandchild. Only returns on error; on success the process
/// image is replaced by the payload.
pub fn run(
    table: &SyscallTable,
    pipe_pid: &mut SyncPipe,
    pipe_continue: &mut SyncPipe,
    pipe_mounted: &mut SyncPipe,
    pipe_exec: &mut SyncPipe,
    plan: &SpawnPlan,
) -> Result<()> {
    pipe_pid.close_write()?;
    pipe_continue.close_read()?;
    pipe_mounted.close_read()?;
    pipe_exec.close_write()?;

    if plan.contains(Kind::Mount) {
        if let Some(propagation) = plan.propagation {
            mount::set_propagation(table, propagation)?;
        }
    }
    if plan.mountproc {
        mount::mount_proc(table, &plan.mountpoint)?;
    }

    pipe_mounted.send_sync()?;
    pipe_mounted.close_write()?;

    pipe_exec.wait_sync()?;
    pipe_exec.close_read()?;

    let command = match &plan.nscmd {
        Some(cmd) if !cmd.is_empty() => cmd.clone(),
        _ => vec![find_shell()],
    };

    if plan.contains(Kind::Pid) {
        let my_init = find_my_init(&my_init_candidates())?;
        let mut argv = vec![
            my_init.to_string_lossy().into_owned(),
            "--skip-startup-files".to_string(),
            "--skip-runit".to_string(),
            "--quiet".to_string(),
        ];
        argv.extend(command);
        exec(&my_init, &argv)
    } else {
        exec(Path::new(&command[0]), &command)
    }
}

fn exec(path: &Path, args: &[String]) -> Result<()> {
    let file = CString::new(path.to_string_lossy().into_owned())
        .map_err(|_| Error::Argument(format!("{:?} contains an interior NUL byte", path)))?;
    let argv: Vec<CString> = args
        .iter()
        .map(|arg| CString::new(arg.as_str()).unwrap_or_default())
        .collect();
    unistd::execvp(&file, &argv)?;
    Ok(())
}

/// Directories searched for the helper init binary: the installation
/// prefix of the running executable first, then the system locations.
fn my_init_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(exe) = env::current_exe() {
        if let Some(prefix) = exe.parent().and_then(Path::parent) {
            candidates.push(prefix.join("lib/procszoo/my_init"));
            candidates.push(prefix.join("bin/my_init"));
        }
    }
    candidates.push(PathBuf::from("/usr/local/lib/procszoo/my_init"));
    candidates.push(PathBuf::from("/usr/lib/procszoo/my_init"));
    candidates
}

fn find_my_init(candidates: &[PathBuf]) -> Result<PathBuf> {
    candidates
        .iter()
        .find(|path| path.exists())
        .cloned()
        .ok_or_else(|| {
            Error::NamespaceSetting("my_init helper binary not found".to_string())
        })
}

/// The payload to run when the caller did not name one: `$SHELL` if set,
/// a well-known bash otherwise, a plain `sh` from the search path as the
/// last resort.
fn find_shell() -> String {
    if let Ok(shell) = env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for dir in &["/bin", "/usr/bin", "/usr/local/bin"] {
        let path = PathBuf::from(dir).join("bash");
        if path.is_file() && unistd::access(&path, AccessFlags::X_OK).is_ok() {
            return path.to_string_lossy().into_owned();
        }
    }
    "sh".to_string()
}
