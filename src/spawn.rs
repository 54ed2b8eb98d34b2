//! The spawn request: what to create, how to map identities, what to run.
//!
//! A request is normalised against the catalog before any fork happens:
//! defaults are filled in, options that depend on an unavailable namespace
//! kind are degraded, implied kinds are added to the set, and the
//! invariants that cannot be repaired reject the request.

use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use nix::unistd::Uid;

use crate::error::{Error, Result};
use crate::idmap::Setgroups;
use crate::mount::Propagation;
use crate::namespaces::{Catalog, Kind};

/// Parameters for spawning a process inside new namespaces. The builder
/// defaults mirror the interactive case: all available namespaces, root
/// mapped to the caller, a fresh proc mount, and the login shell as the
/// payload.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub namespaces: Option<Vec<String>>,
    pub negative_namespaces: Vec<String>,
    pub maproot: bool,
    pub mountproc: bool,
    pub mountpoint: Option<PathBuf>,
    pub ns_bind_dir: Option<PathBuf>,
    pub nscmd: Option<Vec<String>>,
    pub propagation: Option<Propagation>,
    pub setgroups: Option<Setgroups>,
    pub users_map: Vec<String>,
    pub groups_map: Vec<String>,
}

impl Default for SpawnRequest {
    fn default() -> Self {
        SpawnRequest {
            namespaces: None,
            negative_namespaces: Vec::new(),
            maproot: true,
            mountproc: true,
            mountpoint: None,
            ns_bind_dir: None,
            nscmd: None,
            propagation: None,
            setgroups: None,
            users_map: Vec::new(),
            groups_map: Vec::new(),
        }
    }
}

impl SpawnRequest {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn namespaces<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn negative_namespaces<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.negative_namespaces = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn maproot(mut self, maproot: bool) -> Self {
        self.maproot = maproot;
        self
    }

    pub fn mountproc(mut self, mountproc: bool) -> Self {
        self.mountproc = mountproc;
        self
    }

    pub fn mountpoint<P: Into<PathBuf>>(mut self, mountpoint: P) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn ns_bind_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.ns_bind_dir = Some(dir.into());
        self
    }

    pub fn nscmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nscmd = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = Some(propagation);
        self
    }

    pub fn setgroups(mut self, setgroups: Setgroups) -> Self {
        self.setgroups = Some(setgroups);
        self
    }

    pub fn users_map<I, S>(mut self, map: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users_map = map.into_iter().map(Into::into).collect();
        self
    }

    pub fn groups_map<I, S>(mut self, map: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups_map = map.into_iter().map(Into::into).collect();
        self
    }

    /// Spawn through the process-wide workbench.
    pub fn spawn(&self) -> Result<()> {
        crate::workbench().spawn_namespaces(self)
    }

    /// Resolve the request into a concrete plan. `euid` is the caller's
    /// effective uid, passed in so the privilege rules are a pure function
    /// of their inputs.
    pub(crate) fn normalize(&self, catalog: &Catalog, euid: Uid) -> Result<SpawnPlan> {
        let mut maproot = self.maproot;
        let mut mountproc = self.mountproc;
        let mut mountpoint = self.mountpoint.clone();
        let mut ns_bind_dir = self.ns_bind_dir.clone();
        let mut propagation = self.propagation;
        let mut setgroups = self.setgroups;
        let mut users_map = self.users_map.clone();
        let mut groups_map = self.groups_map.clone();

        if setgroups == Some(Setgroups::Allow) && maproot {
            return Err(Error::NamespaceSetting(
                "setgroups 'allow' cannot be combined with maproot".to_string(),
            ));
        }

        if !catalog.available(Kind::User) {
            maproot = false;
            users_map.clear();
            groups_map.clear();
        }
        if !catalog.available(Kind::Pid) {
            mountproc = false;
            mountpoint = None;
        }
        if mountproc && mountpoint.is_none() {
            mountpoint = Some(PathBuf::from("/proc"));
        }
        if !catalog.available(Kind::Mount) {
            propagation = None;
        }

        let include: Option<Vec<&str>> = self
            .namespaces
            .as_ref()
            .map(|names| names.iter().map(String::as_str).collect());
        let exclude: Vec<&str> = self
            .negative_namespaces
            .iter()
            .map(String::as_str)
            .collect();
        let mut kinds = catalog.adjust(include.as_deref(), Some(&exclude))?;

        let unavailable: Vec<String> = kinds
            .iter()
            .filter(|kind| !catalog.available(**kind))
            .map(|kind| kind.name().to_string())
            .collect();
        if !unavailable.is_empty() {
            return Err(Error::UnavailableNamespace(unavailable));
        }

        let requires_root = !catalog.available(Kind::User)
            || (!kinds.is_empty() && !kinds.contains(&Kind::User))
            || ns_bind_dir.is_some()
            || !users_map.is_empty()
            || !groups_map.is_empty();
        if requires_root && !euid.is_root() {
            return Err(Error::RequiresSuperuser);
        }

        if mountproc {
            if !catalog.available(Kind::Mount) {
                return Err(Error::NamespaceSetting(
                    "mounting a fresh proc requires a mount namespace".to_string(),
                ));
            }
            if !kinds.contains(&Kind::Mount) {
                kinds.push(Kind::Mount);
            }
        }

        if ns_bind_dir.is_some() {
            if !catalog.available(Kind::Mount) {
                return Err(Error::NamespaceSetting(
                    "pinning namespace files requires a mount namespace".to_string(),
                ));
            }
            if !kinds.contains(&Kind::Mount) {
                kinds.push(Kind::Mount);
            }
        }

        if maproot {
            if !catalog.available(Kind::User) {
                return Err(Error::NamespaceSetting(
                    "mapping root requires a user namespace".to_string(),
                ));
            }
            if !kinds.contains(&Kind::User) {
                kinds.push(Kind::User);
            }
        }

        if catalog.available(Kind::Mount)
            && kinds.contains(&Kind::Mount)
            && propagation.is_none()
        {
            propagation = Some(Propagation::Private);
        }

        if catalog.available(Kind::User) && kinds.contains(&Kind::User) {
            if Path::new("/proc/self/setgroups").exists() {
                if setgroups.is_none() {
                    setgroups = Some(Setgroups::Deny);
                }
            } else if setgroups != Some(Setgroups::Allow) {
                setgroups = None;
            }
        } else {
            setgroups = None;
        }

        if !kinds.contains(&Kind::User) {
            maproot = false;
            setgroups = None;
            users_map.clear();
            groups_map.clear();
        }
        if !kinds.contains(&Kind::Pid) {
            mountproc = false;
        }
        if !kinds.contains(&Kind::Mount) {
            ns_bind_dir = None;
            propagation = None;
            mountproc = false;
        }

        if users_map.len() > 5 || groups_map.len() > 5 {
            return Err(Error::NamespaceSetting(
                "at most 5 uid/gid map entries are accepted".to_string(),
            ));
        }

        let flags = kinds
            .iter()
            .fold(CloneFlags::empty(), |acc, kind| acc | kind.flag());

        Ok(SpawnPlan {
            kinds,
            flags,
            maproot,
            mountproc,
            mountpoint: mountpoint.unwrap_or_else(|| PathBuf::from("/proc")),
            ns_bind_dir,
            nscmd: self.nscmd.clone(),
            propagation,
            setgroups,
            users_map,
            groups_map,
        })
    }
}

/// A validated, fully defaulted spawn request, ready for the coordinator.
#[derive(Debug, Clone)]
pub(crate) struct SpawnPlan {
    pub kinds: Vec<Kind>,
    pub flags: CloneFlags,
    pub maproot: bool,
    pub mountproc: bool,
    pub mountpoint: PathBuf,
    pub ns_bind_dir: Option<PathBuf>,
    pub nscmd: Option<Vec<String>>,
    pub propagation: Option<Propagation>,
    pub setgroups: Option<Setgroups>,
    pub users_map: Vec<String>,
    pub groups_map: Vec<String>,
}

impl SpawnPlan {
    pub fn contains(&self, kind: Kind) -> bool {
        self.kinds.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespaces::KindSet;

    fn full_catalog() -> Catalog {
        Catalog::with_probed(KindSet::full())
    }

    fn root() -> Uid {
        Uid::from_raw(0)
    }

    fn nobody() -> Uid {
        Uid::from_raw(65534)
    }

    #[test]
    fn test_setgroups_allow_conflicts_with_maproot() {
        let request = SpawnRequest::new().setgroups(Setgroups::Allow);
        let err = request.normalize(&full_catalog(), root()).unwrap_err();
        assert!(matches!(err, Error::NamespaceSetting(_)));
    }

    #[test]
    fn test_setgroups_allow_without_maproot_is_accepted() {
        let request = SpawnRequest::new()
            .maproot(false)
            .setgroups(Setgroups::Allow)
            .namespaces(vec!["user"]);
        let plan = request.normalize(&full_catalog(), nobody()).unwrap();
        assert_eq!(plan.setgroups, Some(Setgroups::Allow));
    }

    #[test]
    fn test_unknown_namespace_rejected() {
        let request = SpawnRequest::new().namespaces(vec!["banana"]);
        let err = request.normalize(&full_catalog(), root()).unwrap_err();
        match err {
            Error::UnknownNamespace(names) => assert_eq!(names, vec!["banana"]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unavailable_namespace_rejected() {
        let mut set = KindSet::full();
        set.remove(Kind::Net);
        let catalog = Catalog::with_probed(set);

        let request = SpawnRequest::new().namespaces(vec!["net"]);
        let err = request.normalize(&catalog, root()).unwrap_err();
        match err {
            Error::UnavailableNamespace(names) => assert_eq!(names, vec!["net"]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_no_user_namespace_requires_root() {
        let request = SpawnRequest::new()
            .maproot(false)
            .mountproc(false)
            .namespaces(vec!["net"]);
        let err = request.normalize(&full_catalog(), nobody()).unwrap_err();
        assert!(matches!(err, Error::RequiresSuperuser));

        assert!(request.normalize(&full_catalog(), root()).is_ok());
    }

    #[test]
    fn test_ns_bind_dir_requires_root_and_adds_mount() {
        let request = SpawnRequest::new()
            .namespaces(vec!["user"])
            .ns_bind_dir("/tmp/ns-pins");
        assert!(matches!(
            request.normalize(&full_catalog(), nobody()),
            Err(Error::RequiresSuperuser)
        ));

        let plan = request.normalize(&full_catalog(), root()).unwrap();
        assert!(plan.contains(Kind::Mount));
        assert_eq!(plan.ns_bind_dir, Some(PathBuf::from("/tmp/ns-pins")));
    }

    #[test]
    fn test_defaults_fill_in() {
        let request = SpawnRequest::new();
        let plan = request.normalize(&full_catalog(), root()).unwrap();

        assert_eq!(plan.kinds.len(), 7);
        assert!(plan.maproot);
        assert!(plan.mountproc);
        assert_eq!(plan.mountpoint, PathBuf::from("/proc"));
        assert_eq!(plan.propagation, Some(Propagation::Private));
        assert!(plan.flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(plan.flags.contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn test_mountproc_adds_mount_namespace() {
        let request = SpawnRequest::new().namespaces(vec!["pid", "user"]);
        let plan = request.normalize(&full_catalog(), nobody()).unwrap();
        assert!(plan.mountproc);
        assert!(plan.contains(Kind::Mount));
    }

    #[test]
    fn test_maproot_adds_user_namespace() {
        let request = SpawnRequest::new().mountproc(false).namespaces(vec!["uts"]);
        let plan = request.normalize(&full_catalog(), root()).unwrap();
        assert!(plan.contains(Kind::User));
        assert!(plan.maproot);
    }

    #[test]
    fn test_unavailable_user_namespace_degrades_identity_options() {
        let mut set = KindSet::full();
        set.remove(Kind::User);
        let catalog = Catalog::with_probed(set);

        let request = SpawnRequest::new().users_map(vec!["1000 0 1"]);
        let plan = request.normalize(&catalog, root()).unwrap();
        assert!(!plan.maproot);
        assert!(plan.users_map.is_empty());
        assert!(plan.setgroups.is_none());
        assert!(!plan.contains(Kind::User));
    }

    #[test]
    fn test_no_pid_namespace_disables_mountproc() {
        let request = SpawnRequest::new()
            .maproot(false)
            .namespaces(vec!["user", "uts"]);
        let plan = request.normalize(&full_catalog(), nobody()).unwrap();
        assert!(!plan.mountproc);
        // the mount namespace was still added before mountproc degraded
        assert!(plan.contains(Kind::Mount));
    }

    #[test]
    fn test_negative_namespaces_subtract() {
        let request = SpawnRequest::new()
            .maproot(false)
            .mountproc(false)
            .negative_namespaces(vec!["pid", "net", "cgroup", "ipc", "uts", "mount"]);
        let plan = request.normalize(&full_catalog(), nobody()).unwrap();
        assert_eq!(plan.kinds, vec![Kind::User]);
    }

    #[test]
    fn test_oversized_maps_rejected() {
        let users: Vec<String> = (0..6).map(|i| format!("{} {} 1", i, i + 1000)).collect();
        let request = SpawnRequest::new().maproot(false).users_map(users);
        let err = request.normalize(&full_catalog(), root()).unwrap_err();
        assert!(matches!(err, Error::NamespaceSetting(_)));
    }
}
