//! Mount and unmount wrappers encoding the propagation presets into the
//! kernel's mount flag vocabulary.

use std::path::Path;
use std::str::FromStr;

use libc::c_long;

use crate::error::{Error, Result};
use crate::syscall::SyscallTable;

pub const MS_NOSUID: c_long = 2;
pub const MS_NODEV: c_long = 4;
pub const MS_NOEXEC: c_long = 8;
pub const MS_BIND: c_long = 4096;
pub const MS_REC: c_long = 16384;
pub const MS_PRIVATE: c_long = 1 << 18;
pub const MS_SLAVE: c_long = 1 << 19;
pub const MS_SHARED: c_long = 1 << 20;

pub const MNT_FORCE: libc::c_int = 1;
pub const MNT_DETACH: libc::c_int = 2;
pub const MNT_EXPIRE: libc::c_int = 4;
pub const UMOUNT_NOFOLLOW: libc::c_int = 8;

/// Propagation presets for the mount operation. Each resolves to an OR of
/// mount flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Private,
    Slave,
    Shared,
    Bind,
    MountProc,
    Unchanged,
}

impl Propagation {
    pub const ALL: [Propagation; 6] = [
        Propagation::Private,
        Propagation::Slave,
        Propagation::Shared,
        Propagation::Bind,
        Propagation::MountProc,
        Propagation::Unchanged,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Propagation::Private => "private",
            Propagation::Slave => "slave",
            Propagation::Shared => "shared",
            Propagation::Bind => "bind",
            Propagation::MountProc => "mount_proc",
            Propagation::Unchanged => "unchanged",
        }
    }

    pub fn flags(self) -> c_long {
        match self {
            Propagation::Private => MS_REC | MS_PRIVATE,
            Propagation::Slave => MS_REC | MS_SLAVE,
            Propagation::Shared => MS_REC | MS_SHARED,
            Propagation::Bind => MS_BIND,
            Propagation::MountProc => MS_NOSUID | MS_NODEV | MS_NOEXEC,
            Propagation::Unchanged => 0,
        }
    }
}

impl FromStr for Propagation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Propagation::ALL
            .iter()
            .find(|p| p.name() == s)
            .copied()
            .ok_or_else(|| Error::Argument(format!("{}: unknown propagation type", s)))
    }
}

/// Behaviours accepted by `umount2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmountBehavior {
    Force,
    Detach,
    Expire,
    Nofollow,
}

impl UmountBehavior {
    pub fn flag(self) -> libc::c_int {
        match self {
            UmountBehavior::Force => MNT_FORCE,
            UmountBehavior::Detach => MNT_DETACH,
            UmountBehavior::Expire => MNT_EXPIRE,
            UmountBehavior::Nofollow => UMOUNT_NOFOLLOW,
        }
    }
}

impl FromStr for UmountBehavior {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "force" => Ok(UmountBehavior::Force),
            "detach" => Ok(UmountBehavior::Detach),
            "expire" => Ok(UmountBehavior::Expire),
            "nofollow" => Ok(UmountBehavior::Nofollow),
            other => Err(Error::Argument(format!(
                "umount behavior should be one of force, detach, expire, nofollow, not {:?}",
                other
            ))),
        }
    }
}

/// The general mount entry point. A call with nothing set is a no-op; an
/// unset source is passed to the kernel as the literal string "none".
pub fn mount(
    table: &SyscallTable,
    source: Option<&str>,
    target: Option<&Path>,
    propagation: Option<Propagation>,
    fstype: Option<&str>,
    data: Option<&str>,
) -> Result<()> {
    if source.is_none() && target.is_none() && fstype.is_none() && propagation.is_none() {
        return Ok(());
    }

    let source = source.unwrap_or("none");
    let flags = propagation.unwrap_or(Propagation::Unchanged).flags();
    log::debug!(
        "mount {} on {:?} type {:?} flags {:#x}",
        source,
        target,
        fstype,
        flags
    );
    table.mount(Some(source), target, fstype, flags, data)
}

pub fn umount(table: &SyscallTable, mountpoint: &Path) -> Result<()> {
    if !mountpoint.exists() {
        return Err(Error::Argument(format!(
            "mount point {:?}: cannot be found",
            mountpoint
        )));
    }
    table.umount(mountpoint)
}

pub fn umount2(table: &SyscallTable, mountpoint: &Path, behavior: UmountBehavior) -> Result<()> {
    if !mountpoint.exists() {
        return Err(Error::Argument(format!(
            "mount point {:?}: cannot be found",
            mountpoint
        )));
    }
    table.umount2(mountpoint, behavior.flag())
}

/// Change the propagation of `/` inside the current mount namespace.
pub fn set_propagation(table: &SyscallTable, propagation: Propagation) -> Result<()> {
    if propagation == Propagation::Unchanged {
        return Ok(());
    }
    mount(
        table,
        Some("none"),
        Some(Path::new("/")),
        Some(propagation),
        None,
        None,
    )
}

/// Mount a fresh proc filesystem at `mountpoint`. The mount point is made
/// private first so the new proc does not propagate to the parent
/// namespace.
pub fn mount_proc(table: &SyscallTable, mountpoint: &Path) -> Result<()> {
    mount(
        table,
        Some("none"),
        Some(mountpoint),
        Some(Propagation::Private),
        None,
        None,
    )?;
    mount(
        table,
        Some("proc"),
        Some(mountpoint),
        Some(Propagation::MountProc),
        Some("proc"),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::mount::{MntFlags, MsFlags};

    #[test]
    fn test_flag_values_match_kernel_constants() {
        assert_eq!(MS_NOSUID, MsFlags::MS_NOSUID.bits() as c_long);
        assert_eq!(MS_NODEV, MsFlags::MS_NODEV.bits() as c_long);
        assert_eq!(MS_NOEXEC, MsFlags::MS_NOEXEC.bits() as c_long);
        assert_eq!(MS_BIND, MsFlags::MS_BIND.bits() as c_long);
        assert_eq!(MS_REC, MsFlags::MS_REC.bits() as c_long);
        assert_eq!(MS_PRIVATE, MsFlags::MS_PRIVATE.bits() as c_long);
        assert_eq!(MS_SLAVE, MsFlags::MS_SLAVE.bits() as c_long);
        assert_eq!(MS_SHARED, MsFlags::MS_SHARED.bits() as c_long);
    }

    #[test]
    fn test_propagation_presets_resolve_to_published_flags() {
        assert_eq!(Propagation::Private.flags(), MS_REC | MS_PRIVATE);
        assert_eq!(Propagation::Slave.flags(), MS_REC | MS_SLAVE);
        assert_eq!(Propagation::Shared.flags(), MS_REC | MS_SHARED);
        assert_eq!(Propagation::Bind.flags(), MS_BIND);
        assert_eq!(
            Propagation::MountProc.flags(),
            MS_NOSUID | MS_NODEV | MS_NOEXEC
        );
        assert_eq!(Propagation::Unchanged.flags(), 0);
    }

    #[test]
    fn test_umount_behaviors_match_kernel_constants() {
        assert_eq!(UmountBehavior::Force.flag(), MntFlags::MNT_FORCE.bits());
        assert_eq!(UmountBehavior::Detach.flag(), MntFlags::MNT_DETACH.bits());
        assert_eq!(UmountBehavior::Expire.flag(), MntFlags::MNT_EXPIRE.bits());
        assert_eq!(
            UmountBehavior::Nofollow.flag(),
            MntFlags::UMOUNT_NOFOLLOW.bits()
        );
    }

    #[test]
    fn test_propagation_from_str() {
        assert_eq!(
            Propagation::from_str("mount_proc").unwrap(),
            Propagation::MountProc
        );
        assert!(Propagation::from_str("sideways").is_err());
    }

    #[test]
    fn test_mount_with_nothing_set_is_noop() {
        let table = SyscallTable::new();
        assert!(mount(&table, None, None, None, None, None).is_ok());
    }

    #[test]
    fn test_umount_missing_mountpoint() {
        let table = SyscallTable::new();
        let err = umount(&table, Path::new("/no/such/mount/point")).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn test_set_propagation_unchanged_is_noop() {
        let table = SyscallTable::new();
        assert!(set_propagation(&table, Propagation::Unchanged).is_ok());
    }

    quickcheck::quickcheck! {
        fn prop_propagation_flags_only_use_published_bits(idx: usize) -> bool {
            let preset = Propagation::ALL[idx % Propagation::ALL.len()];
            let published = MS_NOSUID | MS_NODEV | MS_NOEXEC | MS_BIND | MS_REC
                | MS_PRIVATE | MS_SLAVE | MS_SHARED;
            preset.flags() & !published == 0
        }
    }
}
