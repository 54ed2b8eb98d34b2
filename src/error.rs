//! The error taxonomy shared by every part of the toolkit.

use nix::errno::Errno;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller named a namespace that is not in the catalog.
    #[error("unknown namespace: {}", .0.join(", "))]
    UnknownNamespace(Vec<String>),

    /// The namespace is in the catalog but the running kernel does not
    /// support it.
    #[error("unavailable namespace: {}", .0.join(", "))]
    UnavailableNamespace(Vec<String>),

    /// An internal constraint on the requested configuration was violated.
    #[error("namespace setting error: {0}")]
    NamespaceSetting(String),

    /// The requested configuration needs uid 0 but the caller is not root.
    #[error("this operation requires superuser privilege")]
    RequiresSuperuser,

    /// A wrapped C function could neither be resolved from the C library
    /// nor invoked through a syscall-number fallback.
    #[error("c function not available: {0}")]
    FunctionUnavailable(&'static str),

    /// A wrapped call went through to the kernel and came back with an
    /// error.
    #[error("{name} failed: {errno:?}")]
    OsCall { name: &'static str, errno: Errno },

    /// A synchronisation pipe between the spawn participants produced EOF
    /// or an unexpected byte.
    #[error("spawn synchronisation pipe broken")]
    SpawnSync,

    /// Malformed caller arguments, e.g. conflicting `setns` selectors.
    #[error("{0}")]
    Argument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_namespace_lists_names() {
        let err = Error::UnknownNamespace(vec!["banana".into(), "apple".into()]);
        assert_eq!(err.to_string(), "unknown namespace: banana, apple");
    }

    #[test]
    fn test_os_call_carries_name_and_errno() {
        let err = Error::OsCall {
            name: "unshare",
            errno: Errno::EINVAL,
        };
        assert!(err.to_string().contains("unshare"));
        assert!(err.to_string().contains("EINVAL"));
    }
}
