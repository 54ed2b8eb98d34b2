//! The namespace catalog and the kernel capability probe.
//!
//! The catalog is a fixed table of the seven namespace kinds: the logical
//! name, the clone flag the kernel associates with the kind, and the entry
//! name the kind uses under `/proc/<pid>/ns/`. Which kinds the running
//! kernel actually supports is determined once by probing `unshare(2)` in
//! a sacrificial grandchild process, since some distribution kernels ship
//! with individual namespaces compiled out or disabled.

use std::fmt;
use std::process;
use std::str::FromStr;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult};
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::syscall::{Arg, Op, SyscallTable};

/// The namespace kinds the kernel knows about, in catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    User,
    Mount,
    Pid,
    Net,
    Uts,
    Ipc,
    Cgroup,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::User,
        Kind::Mount,
        Kind::Pid,
        Kind::Net,
        Kind::Uts,
        Kind::Ipc,
        Kind::Cgroup,
    ];

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// The clone flag bit that creates a namespace of this kind.
    pub fn flag(self) -> CloneFlags {
        self.descriptor().flag
    }

    /// The file name of this kind under `/proc/<pid>/ns/`.
    pub fn entry(self) -> &'static str {
        self.descriptor().entry
    }

    pub fn descriptor(self) -> &'static Namespace {
        &CATALOG[self.index()]
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Kind::ALL
            .iter()
            .find(|kind| kind.name() == s)
            .copied()
            .ok_or_else(|| Error::UnknownNamespace(vec![s.to_string()]))
    }
}

/// Immutable metadata for one namespace kind.
pub struct Namespace {
    pub kind: Kind,
    pub name: &'static str,
    pub flag: CloneFlags,
    pub entry: &'static str,
    /// Accepted values of the `setgroups` control file; only populated for
    /// the user namespace.
    pub setgroups: &'static [&'static str],
}

pub static CATALOG: [Namespace; 7] = [
    Namespace {
        kind: Kind::User,
        name: "user",
        flag: CloneFlags::CLONE_NEWUSER,
        entry: "user",
        setgroups: &["allow", "deny"],
    },
    Namespace {
        kind: Kind::Mount,
        name: "mount",
        flag: CloneFlags::CLONE_NEWNS,
        entry: "mnt",
        setgroups: &[],
    },
    Namespace {
        kind: Kind::Pid,
        name: "pid",
        flag: CloneFlags::CLONE_NEWPID,
        entry: "pid",
        setgroups: &[],
    },
    Namespace {
        kind: Kind::Net,
        name: "net",
        flag: CloneFlags::CLONE_NEWNET,
        entry: "net",
        setgroups: &[],
    },
    Namespace {
        kind: Kind::Uts,
        name: "uts",
        flag: CloneFlags::CLONE_NEWUTS,
        entry: "uts",
        setgroups: &[],
    },
    Namespace {
        kind: Kind::Ipc,
        name: "ipc",
        flag: CloneFlags::CLONE_NEWIPC,
        entry: "ipc",
        setgroups: &[],
    },
    Namespace {
        kind: Kind::Cgroup,
        name: "cgroup",
        flag: CloneFlags::CLONE_NEWCGROUP,
        entry: "cgroup",
        setgroups: &[],
    },
];

/// A set of namespace kinds, compact enough to travel over the probe pipe
/// as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u8);

impl KindSet {
    pub fn empty() -> Self {
        KindSet(0)
    }

    pub fn full() -> Self {
        let mut set = KindSet::empty();
        for kind in &Kind::ALL {
            set.insert(*kind);
        }
        set
    }

    pub fn from_mask(mask: u8) -> Self {
        KindSet(mask & KindSet::full().0)
    }

    pub fn mask(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, kind: Kind) {
        self.0 |= 1 << kind.index();
    }

    pub fn remove(&mut self, kind: Kind) {
        self.0 &= !(1 << kind.index());
    }

    pub fn contains(self, kind: Kind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }
}

/// The mutable side of the catalog: which kinds the running kernel admits.
/// Until the probe has run every kind is assumed available.
#[derive(Default)]
pub struct Catalog {
    probed: OnceCell<KindSet>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    #[cfg(test)]
    pub(crate) fn with_probed(set: KindSet) -> Self {
        let catalog = Catalog::new();
        catalog.probed.set(set).unwrap();
        catalog
    }

    /// Probe the kernel once and remember the result; later calls are
    /// no-ops.
    pub fn check_available(&self, table: &SyscallTable) -> Result<()> {
        self.probed
            .get_or_try_init(|| {
                let set = probe_kernel(table)?;
                log::debug!("kernel admits namespaces: {:#04x}", set.mask());
                Ok(set)
            })
            .map(drop)
    }

    pub fn available(&self, kind: Kind) -> bool {
        self.probed.get().map_or(true, |set| set.contains(kind))
    }

    /// `(name, available)` pairs in catalog order.
    pub fn status(&self) -> Vec<(Kind, bool)> {
        Kind::ALL
            .iter()
            .map(|kind| (*kind, self.available(*kind)))
            .collect()
    }

    /// Resolve an include/exclude pair of namespace name lists against the
    /// catalog. `include = None` means every available kind, in catalog
    /// order. Unknown names in the include list are an error; excluded
    /// names are simply dropped.
    pub fn adjust(
        &self,
        include: Option<&[&str]>,
        exclude: Option<&[&str]>,
    ) -> Result<Vec<Kind>> {
        let mut kinds = match include {
            None => Kind::ALL
                .iter()
                .filter(|kind| self.available(**kind))
                .copied()
                .collect(),
            Some(names) => parse_names(names)?,
        };

        if let Some(names) = exclude {
            for name in names {
                if let Ok(kind) = Kind::from_str(name) {
                    kinds.retain(|k| *k != kind);
                }
            }
        }

        Ok(kinds)
    }
}

/// Parse namespace names, collecting every unknown one into the error.
pub fn parse_names(names: &[&str]) -> Result<Vec<Kind>> {
    let mut kinds = Vec::with_capacity(names.len());
    let mut unknown = Vec::new();
    for name in names {
        match Kind::from_str(name) {
            Ok(kind) => kinds.push(kind),
            Err(_) => unknown.push(name.to_string()),
        }
    }
    if !unknown.is_empty() {
        return Err(Error::UnknownNamespace(unknown));
    }
    Ok(kinds)
}

/// Ask the kernel which namespace kinds it admits by calling
/// `unshare(flag)` for each kind in a disposable process. Success means
/// available; EINVAL means the kernel does not know the flag; any other
/// errno means the flag is known and the failure is environmental, so the
/// kind still counts as available.
///
/// The probe must run in a grandchild: unsharing CLONE_NEWPID changes the
/// fork semantics of the probing process itself, so nothing that probes it
/// may go on to fork again.
fn probe_kernel(table: &SyscallTable) -> Result<KindSet> {
    let (read_fd, write_fd) = unistd::pipe()?;

    match unsafe { unistd::fork()? } {
        ForkResult::Child => {
            let code = match probe_intermediate(table, read_fd, write_fd) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            process::exit(code);
        }
        ForkResult::Parent { child } => {
            let _ = unistd::close(write_fd);
            let _ = waitpid(child, None);

            let mut buf = [0u8; 1];
            let n = unistd::read(read_fd, &mut buf);
            let _ = unistd::close(read_fd);
            match n {
                Ok(1) => Ok(KindSet::from_mask(buf[0])),
                _ => Err(Error::SpawnSync),
            }
        }
    }
}

fn probe_intermediate(
    table: &SyscallTable,
    read_fd: std::os::unix::io::RawFd,
    write_fd: std::os::unix::io::RawFd,
) -> Result<()> {
    match unsafe { unistd::fork()? } {
        ForkResult::Child => {
            let _ = unistd::close(read_fd);
            let mut set = KindSet::empty();
            for kind in &Kind::ALL {
                let flag = kind.flag().bits();
                match table.invoke_raw(Op::Unshare, &[Arg::Int(flag)]) {
                    Ok((0, _)) => set.insert(*kind),
                    Ok((_, errno)) if errno != Errno::EINVAL => set.insert(*kind),
                    _ => {}
                }
            }
            let _ = unistd::write(write_fd, &[set.mask()]);
            let _ = unistd::close(write_fd);
            process::exit(0);
        }
        ForkResult::Parent { child } => {
            waitpid(child, None)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_order_and_entries() {
        let names: Vec<&str> = Kind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            vec!["user", "mount", "pid", "net", "uts", "ipc", "cgroup"]
        );
        assert_eq!(Kind::Mount.entry(), "mnt");
        assert_eq!(Kind::Net.entry(), "net");
    }

    #[test]
    fn test_clone_flags_match_kinds() {
        assert_eq!(Kind::User.flag(), CloneFlags::CLONE_NEWUSER);
        assert_eq!(Kind::Mount.flag(), CloneFlags::CLONE_NEWNS);
        assert_eq!(Kind::Pid.flag(), CloneFlags::CLONE_NEWPID);
        assert_eq!(Kind::Cgroup.flag(), CloneFlags::CLONE_NEWCGROUP);
    }

    #[test]
    fn test_setgroups_vocabulary_only_on_user() {
        for ns in &CATALOG {
            if ns.kind == Kind::User {
                assert_eq!(ns.setgroups, &["allow", "deny"]);
            } else {
                assert!(ns.setgroups.is_empty());
            }
        }
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!(Kind::from_str("uts").unwrap(), Kind::Uts);
        assert!(matches!(
            Kind::from_str("banana"),
            Err(Error::UnknownNamespace(_))
        ));
    }

    #[test]
    fn test_kind_set_round_trip() {
        let mut set = KindSet::empty();
        set.insert(Kind::Pid);
        set.insert(Kind::Uts);
        let copied = KindSet::from_mask(set.mask());
        assert!(copied.contains(Kind::Pid));
        assert!(copied.contains(Kind::Uts));
        assert!(!copied.contains(Kind::User));
    }

    #[test]
    fn test_adjust_defaults_to_available_in_catalog_order() {
        let mut set = KindSet::full();
        set.remove(Kind::Cgroup);
        let catalog = Catalog::with_probed(set);
        let kinds = catalog.adjust(None, None).unwrap();
        assert_eq!(
            kinds,
            vec![Kind::User, Kind::Mount, Kind::Pid, Kind::Net, Kind::Uts, Kind::Ipc]
        );
    }

    #[test]
    fn test_adjust_exclude_subtracts() {
        let catalog = Catalog::with_probed(KindSet::full());
        let kinds = catalog.adjust(None, Some(&["pid", "net"])).unwrap();
        assert!(!kinds.contains(&Kind::Pid));
        assert!(!kinds.contains(&Kind::Net));
        assert_eq!(kinds.len(), 5);
    }

    #[test]
    fn test_adjust_unknown_include_errors() {
        let catalog = Catalog::with_probed(KindSet::full());
        match catalog.adjust(Some(&["pid", "banana"]), None) {
            Err(Error::UnknownNamespace(names)) => assert_eq!(names, vec!["banana"]),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unprobed_catalog_assumes_available() {
        let catalog = Catalog::new();
        for kind in &Kind::ALL {
            assert!(catalog.available(*kind));
        }
    }

    #[test]
    fn test_probe_is_idempotent() {
        let table = SyscallTable::new();
        let catalog = Catalog::new();
        catalog.check_available(&table).unwrap();
        let first = catalog.status();
        catalog.check_available(&table).unwrap();
        assert_eq!(first, catalog.status());
        assert_eq!(first.len(), 7);
    }

    quickcheck::quickcheck! {
        fn prop_adjust_exclude_is_set_difference(mask: u8) -> bool {
            let catalog = Catalog::with_probed(KindSet::full());
            let excluded = KindSet::from_mask(mask);
            let names: Vec<&str> = Kind::ALL
                .iter()
                .filter(|k| excluded.contains(**k))
                .map(|k| k.name())
                .collect();
            let kinds = catalog.adjust(None, Some(&names)).unwrap();
            Kind::ALL
                .iter()
                .all(|k| kinds.contains(k) != excluded.contains(*k))
        }
    }
}
