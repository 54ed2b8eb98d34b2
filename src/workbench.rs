//! The facade aggregating the syscall registry, the namespace catalog and
//! the identity mapper behind one process-wide object.

use std::env;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use nix::unistd;
use once_cell::sync::Lazy;

use crate::bind;
use crate::error::{Error, Result};
use crate::idmap::{IdMapper, Setgroups};
use crate::mount::{self, Propagation, UmountBehavior};
use crate::namespaces::{parse_names, Catalog, Kind};
use crate::process;
use crate::spawn::SpawnRequest;
use crate::syscall::SyscallTable;

static WORKBENCH: Lazy<Workbench> = Lazy::new(Workbench::new);

/// The process-wide default instance backing the crate-level free
/// functions.
pub fn workbench() -> &'static Workbench {
    &WORKBENCH
}

/// Selects the namespace for [`Workbench::setns`]. Exactly one of the
/// fd/path/pid/file selectors must be set; the namespace kind is optional
/// for fd, path and file selectors and required for pid.
#[derive(Debug, Default)]
pub struct SetnsRequest {
    fd: Option<RawFd>,
    path: Option<PathBuf>,
    pid: Option<libc::pid_t>,
    file: Option<File>,
    namespace: Option<Kind>,
}

impl SetnsRequest {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn fd(mut self, fd: RawFd) -> Self {
        self.fd = Some(fd);
        self
    }

    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn pid(mut self, pid: libc::pid_t) -> Self {
        self.pid = Some(pid);
        self
    }

    /// The file is consumed; its descriptor is closed when the call
    /// returns, success or failure.
    pub fn file(mut self, file: File) -> Self {
        self.file = Some(file);
        self
    }

    pub fn namespace(mut self, kind: Kind) -> Self {
        self.namespace = Some(kind);
        self
    }

    fn selectors(&self) -> Vec<&'static str> {
        let mut given = Vec::new();
        if self.fd.is_some() {
            given.push("fd");
        }
        if self.path.is_some() {
            given.push("path");
        }
        if self.pid.is_some() {
            given.push("pid");
        }
        if self.file.is_some() {
            given.push("file");
        }
        given
    }
}

pub struct Workbench {
    table: SyscallTable,
    catalog: Catalog,
    mapper: IdMapper,
}

impl Default for Workbench {
    fn default() -> Self {
        Self::new()
    }
}

impl Workbench {
    pub fn new() -> Self {
        Workbench {
            table: SyscallTable::new(),
            catalog: Catalog::new(),
            mapper: IdMapper::new(),
        }
    }

    /// Probe the kernel for the supported namespace kinds. Idempotent.
    pub fn check_namespaces_available_status(&self) -> Result<()> {
        self.catalog.check_available(&self.table)
    }

    /// `(kind, available)` pairs in catalog order.
    pub fn show_namespaces_status(&self) -> Result<Vec<(Kind, bool)>> {
        self.check_namespaces_available_status()?;
        Ok(self.catalog.status())
    }

    pub fn namespace_available(&self, kind: Kind) -> bool {
        self.catalog.available(kind)
    }

    /// Names of the wrapped C functions that resolved on this system.
    pub fn show_available_c_functions(&self) -> Vec<&'static str> {
        self.table.available_functions()
    }

    pub fn adjust_namespaces(
        &self,
        include: Option<&[&str]>,
        exclude: Option<&[&str]>,
    ) -> Result<Vec<Kind>> {
        self.check_namespaces_available_status()?;
        self.catalog.adjust(include, exclude)
    }

    /// Detach the calling process from the named namespaces. Unknown
    /// names are an error; known kinds the kernel lacks are skipped.
    pub fn unshare(&self, namespaces: &[&str]) -> Result<()> {
        let kinds = parse_names(namespaces)?;
        let flags = kinds
            .iter()
            .filter(|kind| self.catalog.available(**kind))
            .fold(CloneFlags::empty(), |acc, kind| acc | kind.flag());
        self.table.unshare(flags.bits())
    }

    /// Attach the calling process to an existing namespace.
    pub fn setns(&self, request: SetnsRequest) -> Result<()> {
        let given = request.selectors();
        if given.len() != 1 {
            return Err(Error::Argument(format!(
                "setns needs exactly one of fd, path, pid, file; got [{}]",
                given.join(", ")
            )));
        }

        let nstype = request.namespace.map_or(0, |kind| kind.flag().bits());

        if let Some(fd) = request.fd {
            return self.table.setns(fd, nstype);
        }
        if let Some(file) = &request.file {
            return self.table.setns(file.as_raw_fd(), nstype);
        }

        let path = match (&request.path, request.pid) {
            (Some(path), None) => {
                let path = absolute(path)?;
                if let Some(kind) = request.namespace {
                    let entry = path.file_name().map(|n| n.to_string_lossy());
                    if entry.as_deref() != Some(kind.entry()) {
                        return Err(Error::Argument(format!(
                            "{:?} does not name a {} namespace",
                            path,
                            kind.name()
                        )));
                    }
                }
                path
            }
            (None, Some(pid)) => {
                let kind = request.namespace.ok_or_else(|| {
                    Error::Argument("setns by pid needs a namespace kind".to_string())
                })?;
                PathBuf::from(format!("/proc/{}/ns/{}", pid, kind.entry()))
            }
            // the selector count check above leaves exactly one set
            _ => unreachable!(),
        };

        if !path.exists() {
            return Err(Error::Argument(format!("{:?} does not exist", path)));
        }

        // the File closes on all exits from this scope
        let file = File::open(&path)?;
        self.table.setns(file.as_raw_fd(), nstype)
    }

    /// Spawn a child process inside new namespaces as described by the
    /// request, configure it cooperatively, and leave it running the
    /// payload. The child is reaped by a process-exit hook.
    pub fn spawn_namespaces(&self, request: &SpawnRequest) -> Result<()> {
        self.check_namespaces_available_status()?;
        let plan = request.normalize(&self.catalog, unistd::geteuid())?;
        log::debug!("spawning namespaces {:?}", plan.kinds);
        process::spawn(&self.table, &self.catalog, &self.mapper, &plan)
    }

    pub fn mount(
        &self,
        source: Option<&str>,
        target: Option<&Path>,
        propagation: Option<Propagation>,
        fstype: Option<&str>,
        data: Option<&str>,
    ) -> Result<()> {
        mount::mount(&self.table, source, target, propagation, fstype, data)
    }

    pub fn umount(&self, mountpoint: &Path) -> Result<()> {
        mount::umount(&self.table, mountpoint)
    }

    pub fn umount2(&self, mountpoint: &Path, behavior: UmountBehavior) -> Result<()> {
        mount::umount2(&self.table, mountpoint, behavior)
    }

    pub fn set_propagation(&self, propagation: Propagation) -> Result<()> {
        mount::set_propagation(&self.table, propagation)
    }

    pub fn mount_proc(&self, mountpoint: &Path) -> Result<()> {
        mount::mount_proc(&self.table, mountpoint)
    }

    /// Bind-mount the namespace files of `pid` under `dir` so the
    /// namespaces survive the process.
    pub fn bind_ns_files(&self, pid: unistd::Pid, kinds: &[Kind], dir: &Path) -> Result<()> {
        bind::bind_ns_files(&self.table, &self.catalog, pid, kinds, dir)
    }

    /// Write the setgroups control file of a child the caller manages
    /// itself.
    pub fn setgroups_control(&self, mode: Setgroups, pid: unistd::Pid) -> Result<()> {
        self.mapper.setgroups_control(mode, pid)
    }

    pub fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()> {
        if !new_root.exists() {
            return Err(Error::Argument(format!(
                "{:?}: no such directory",
                new_root
            )));
        }
        if !put_old.exists() {
            return Err(Error::Argument(format!("{:?}: no such directory", put_old)));
        }
        self.table.pivot_root(new_root, put_old)
    }

    pub fn gethostname(&self) -> Result<String> {
        self.table.gethostname()
    }

    pub fn sethostname(&self, hostname: &str) -> Result<()> {
        self.table.sethostname(hostname)
    }

    pub fn getdomainname(&self) -> Result<String> {
        self.table.getdomainname()
    }

    pub fn setdomainname(&self, domainname: &str) -> Result<()> {
        self.table.setdomainname(domainname)
    }

    pub fn sched_getcpu(&self) -> Result<i32> {
        self.table.sched_getcpu()
    }

    pub fn atfork(
        &self,
        prepare: Option<extern "C" fn()>,
        parent: Option<extern "C" fn()>,
        child: Option<extern "C" fn()>,
    ) -> Result<()> {
        self.table.atfork(prepare, parent, child)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}
