//! Writes the uid/gid map and setgroups control files of a freshly
//! unshared user namespace.
//!
//! The kernel only accepts a single write to each map file, limits the
//! number of mapping lines, and couples gid_map to the setgroups control
//! file, so the order and content of these writes is load-bearing. See
//! user_namespaces(7).

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::unistd::{self, Pid};

use crate::error::{Error, Result};

/// Upper bound the kernel places on mapping lines per map file.
const MAX_MAP_ENTRIES: usize = 5;

/// Value of the `setgroups` control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setgroups {
    Allow,
    Deny,
}

impl Setgroups {
    pub fn as_str(self) -> &'static str {
        match self {
            Setgroups::Allow => "allow",
            Setgroups::Deny => "deny",
        }
    }
}

impl FromStr for Setgroups {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(Setgroups::Allow),
            "deny" => Ok(Setgroups::Deny),
            other => Err(Error::Argument(format!(
                "setgroups should be allow or deny, not {:?}",
                other
            ))),
        }
    }
}

/// Writes identity mappings under a configurable base directory. The base
/// is `/proc` in production; tests point it at a scratch directory.
#[derive(Debug, Clone)]
pub struct IdMapper {
    base: PathBuf,
}

impl Default for IdMapper {
    fn default() -> Self {
        IdMapper {
            base: PathBuf::from("/proc"),
        }
    }
}

impl IdMapper {
    pub fn new() -> Self {
        Default::default()
    }

    #[cfg(test)]
    pub(crate) fn with_base(base: PathBuf) -> Self {
        IdMapper { base }
    }

    fn map_path(&self, pid: Pid, file: &str) -> PathBuf {
        self.base.join(pid.to_string()).join(file)
    }

    /// Write `uid_map` and `gid_map` for `pid`. With `maproot` the first
    /// line maps uid/gid 0 inside the namespace to the caller's effective
    /// ids; caller-supplied lines of the form `<inner> <outer> <count>`
    /// follow. Nothing is written when the resulting list is empty.
    pub fn write_uid_gid_maps(
        &self,
        maproot: bool,
        users_map: &[String],
        groups_map: &[String],
        pid: Pid,
    ) -> Result<()> {
        let root_uid = maproot.then(|| format!("0 {} 1", unistd::geteuid()));
        self.write_map(pid, "uid_map", root_uid, users_map)?;

        let root_gid = maproot.then(|| format!("0 {} 1", unistd::getegid()));
        self.write_map(pid, "gid_map", root_gid, groups_map)?;

        Ok(())
    }

    fn write_map(
        &self,
        pid: Pid,
        file: &str,
        root_line: Option<String>,
        extra: &[String],
    ) -> Result<()> {
        let mut lines: Vec<&str> = Vec::with_capacity(1 + extra.len());
        if let Some(line) = root_line.as_deref() {
            lines.push(line);
        }
        lines.extend(extra.iter().map(String::as_str));

        if lines.is_empty() {
            return Ok(());
        }
        if lines.len() > MAX_MAP_ENTRIES {
            return Err(Error::NamespaceSetting(format!(
                "{} would get {} entries, the kernel accepts at most {}",
                file,
                lines.len(),
                MAX_MAP_ENTRIES
            )));
        }

        let path = self.map_path(pid, file);
        if !path.exists() {
            return Err(Error::NamespaceSetting(format!(
                "{:?}: no such file",
                path
            )));
        }

        let content = format!("{}\n", lines.join("\n"));
        log::debug!("writing {:?}: {:?}", path, content);
        fs::write(&path, content)?;
        Ok(())
    }

    /// Drive the `setgroups` control file of `pid` to `mode`. A kernel
    /// without the control file cannot deny; requesting `deny` there is an
    /// error while any other mode is a no-op. An already matching value is
    /// left untouched.
    pub fn setgroups_control(&self, mode: Setgroups, pid: Pid) -> Result<()> {
        let path = self.map_path(pid, "setgroups");
        if !path.exists() {
            if mode == Setgroups::Deny {
                return Err(Error::NamespaceSetting(
                    "cannot set setgroups to 'deny': kernel has no setgroups control file"
                        .to_string(),
                ));
            }
            return Ok(());
        }

        let current = fs::read_to_string(&path)?;
        if current.trim_end_matches('\n') == mode.as_str() {
            return Ok(());
        }

        log::debug!("writing {:?}: {}", path, mode.as_str());
        fs::write(&path, mode.as_str())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn scratch_mapper(pid: Pid, files: &[&str]) -> Result<(tempfile::TempDir, IdMapper)> {
        let dir = tempfile::tempdir()?;
        let proc_dir = dir.path().join(pid.to_string());
        fs::create_dir_all(&proc_dir)?;
        for file in files {
            fs::write(proc_dir.join(file), "")?;
        }
        let base = dir.path().to_path_buf();
        Ok((dir, IdMapper::with_base(base)))
    }

    #[test]
    fn test_maproot_writes_caller_identity() -> Result<()> {
        let pid = Pid::from_raw(4242);
        let (dir, mapper) = scratch_mapper(pid, &["uid_map", "gid_map"])?;

        mapper.write_uid_gid_maps(true, &[], &[], pid)?;

        let uid_map = fs::read_to_string(dir.path().join("4242/uid_map"))?;
        assert_eq!(uid_map, format!("0 {} 1\n", unistd::geteuid()));
        let gid_map = fs::read_to_string(dir.path().join("4242/gid_map"))?;
        assert_eq!(gid_map, format!("0 {} 1\n", unistd::getegid()));
        Ok(())
    }

    #[test]
    fn test_caller_lines_follow_root_line() -> Result<()> {
        let pid = Pid::from_raw(77);
        let (dir, mapper) = scratch_mapper(pid, &["uid_map", "gid_map"])?;

        let users = vec!["1000 100000 1".to_string(), "1001 100001 1".to_string()];
        mapper.write_uid_gid_maps(true, &users, &[], pid)?;

        let uid_map = fs::read_to_string(dir.path().join("77/uid_map"))?;
        let lines: Vec<&str> = uid_map.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], format!("0 {} 1", unistd::geteuid()));
        assert_eq!(lines[1], "1000 100000 1");
        assert!(uid_map.ends_with('\n'));
        Ok(())
    }

    #[test]
    fn test_empty_maps_write_nothing() -> Result<()> {
        let pid = Pid::from_raw(99);
        let (dir, mapper) = scratch_mapper(pid, &["uid_map", "gid_map"])?;

        mapper.write_uid_gid_maps(false, &[], &[], pid)?;

        assert_eq!(fs::read_to_string(dir.path().join("99/uid_map"))?, "");
        Ok(())
    }

    #[test]
    fn test_too_many_entries_rejected() -> Result<()> {
        let pid = Pid::from_raw(7);
        let (_dir, mapper) = scratch_mapper(pid, &["uid_map", "gid_map"])?;

        let users: Vec<String> = (0..5).map(|i| format!("{} {} 1", i, i + 1000)).collect();
        let err = mapper
            .write_uid_gid_maps(true, &users, &[], pid)
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceSetting(_)));
        Ok(())
    }

    #[test]
    fn test_missing_map_file_rejected() -> Result<()> {
        let pid = Pid::from_raw(13);
        let (_dir, mapper) = scratch_mapper(pid, &[])?;

        let err = mapper.write_uid_gid_maps(true, &[], &[], pid).unwrap_err();
        assert!(matches!(err, Error::NamespaceSetting(_)));
        Ok(())
    }

    #[test]
    fn test_setgroups_deny_needs_control_file() -> Result<()> {
        let pid = Pid::from_raw(21);
        let (_dir, mapper) = scratch_mapper(pid, &[])?;

        assert!(matches!(
            mapper.setgroups_control(Setgroups::Deny, pid),
            Err(Error::NamespaceSetting(_))
        ));
        // allow degrades to a no-op on such kernels
        assert!(mapper.setgroups_control(Setgroups::Allow, pid).is_ok());
        Ok(())
    }

    #[test]
    fn test_setgroups_writes_and_skips_matching_value() -> Result<()> {
        let pid = Pid::from_raw(34);
        let (dir, mapper) = scratch_mapper(pid, &["setgroups"])?;
        let path = dir.path().join("34/setgroups");

        fs::write(&path, "allow\n")?;
        mapper.setgroups_control(Setgroups::Deny, pid)?;
        assert_eq!(fs::read_to_string(&path)?, "deny");

        mapper.setgroups_control(Setgroups::Deny, pid)?;
        assert_eq!(fs::read_to_string(&path)?, "deny");
        Ok(())
    }

    #[test]
    fn test_setgroups_from_str() {
        assert_eq!(Setgroups::from_str("allow").unwrap(), Setgroups::Allow);
        assert_eq!(Setgroups::from_str("deny").unwrap(), Setgroups::Deny);
        assert!(Setgroups::from_str("maybe").is_err());
    }
}
