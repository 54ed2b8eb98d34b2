//! Pins namespaces to the filesystem so they outlive their creating
//! process.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use nix::unistd::{self, AccessFlags, Pid};

use crate::error::{Error, Result};
use crate::mount::{self, Propagation};
use crate::namespaces::{Catalog, Kind};
use crate::syscall::SyscallTable;

/// Bind-mount `/proc/<pid>/ns/<entry>` for each requested namespace onto
/// an empty file under `dir`, creating the directory and the files as
/// needed.
///
/// The mount namespace is always skipped: bind-mounting the mnt entry of
/// a process that shares our mount namespace is ill-defined.
pub fn bind_ns_files(
    table: &SyscallTable,
    catalog: &Catalog,
    pid: Pid,
    kinds: &[Kind],
    dir: &Path,
) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    if unistd::access(dir, AccessFlags::R_OK | AccessFlags::W_OK).is_err() {
        return Err(Error::NamespaceSetting(format!("cannot access {:?}", dir)));
    }

    let ns_dir = PathBuf::from(format!("/proc/{}/ns", pid));
    for kind in kinds {
        if *kind == Kind::Mount || !catalog.available(*kind) {
            continue;
        }
        let source = ns_dir.join(kind.entry());
        let target = dir.join(kind.entry());
        if !target.exists() {
            OpenOptions::new()
                .create(true)
                .write(true)
                .open(&target)?;
        }
        log::debug!("binding {:?} to {:?}", source, target);
        mount::mount(
            table,
            source.to_str(),
            Some(&target),
            Some(Propagation::Bind),
            None,
            None,
        )?;
    }

    Ok(())
}
