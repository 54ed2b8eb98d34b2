use std::ffi::CString;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::Mutex;

use libc::{c_int, c_long, c_void};
use nix::errno::Errno;
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Size of the buffer handed to `gethostname`/`getdomainname`.
pub const HOST_NAME_MAX: usize = 256;

/// Fork handlers are process-global and must stay registered for the
/// lifetime of the process, so the list is append-only. Handlers are
/// compared by address and registered with the kernel at most once.
static FORK_HANDLERS: Lazy<Mutex<Vec<usize>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// The logical operations the toolkit needs from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Unshare,
    Setns,
    Mount,
    Umount,
    Umount2,
    PivotRoot,
    Gethostname,
    Sethostname,
    Getdomainname,
    Setdomainname,
    SchedGetcpu,
    Atfork,
}

impl Op {
    const ALL: [Op; 12] = [
        Op::Unshare,
        Op::Setns,
        Op::Mount,
        Op::Umount,
        Op::Umount2,
        Op::PivotRoot,
        Op::Gethostname,
        Op::Sethostname,
        Op::Getdomainname,
        Op::Setdomainname,
        Op::SchedGetcpu,
        Op::Atfork,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Op::Unshare => "unshare",
            Op::Setns => "setns",
            Op::Mount => "mount",
            Op::Umount => "umount",
            Op::Umount2 => "umount2",
            Op::PivotRoot => "pivot_root",
            Op::Gethostname => "gethostname",
            Op::Sethostname => "sethostname",
            Op::Getdomainname => "getdomainname",
            Op::Setdomainname => "setdomainname",
            Op::SchedGetcpu => "sched_getcpu",
            Op::Atfork => "atfork",
        }
    }

    /// Symbol names to probe in the C library, in order of preference.
    fn candidates(self) -> &'static [&'static str] {
        match self {
            // pivot_root has no glibc wrapper, it is only reachable
            // through its syscall number.
            Op::PivotRoot => &[],
            Op::Atfork => &["pthread_atfork", "__register_atfork"],
            Op::Unshare => &["unshare"],
            Op::Setns => &["setns"],
            Op::Mount => &["mount"],
            Op::Umount => &["umount"],
            Op::Umount2 => &["umount2"],
            Op::Gethostname => &["gethostname"],
            Op::Sethostname => &["sethostname"],
            Op::Getdomainname => &["getdomainname"],
            Op::Setdomainname => &["setdomainname"],
            Op::SchedGetcpu => &["sched_getcpu"],
        }
    }

    fn fallback_nr(self) -> Option<c_long> {
        match self {
            Op::Setns => Some(libc::SYS_setns),
            Op::PivotRoot => Some(libc::SYS_pivot_root),
            _ => None,
        }
    }

    fn failed(self) -> fn(c_long) -> bool {
        match self {
            Op::SchedGetcpu | Op::Atfork => |res| res == -1,
            _ => |res| res != 0,
        }
    }
}

/// An argument handed to [`SyscallTable::invoke`]. Owned C strings live in
/// the slice for the duration of the call, so the marshalled pointers stay
/// valid.
pub enum Arg {
    Int(c_int),
    Long(c_long),
    Size(libc::size_t),
    Str(CString),
    /// A nullable C string; `None` marshals to a null pointer.
    OptStr(Option<CString>),
    Ptr(*mut c_void),
}

impl Arg {
    fn to_raw(&self) -> usize {
        match self {
            Arg::Int(v) => *v as usize,
            Arg::Long(v) => *v as usize,
            Arg::Size(v) => *v,
            Arg::Str(s) => s.as_ptr() as usize,
            Arg::OptStr(Some(s)) => s.as_ptr() as usize,
            Arg::OptStr(None) => 0,
            Arg::Ptr(p) => *p as usize,
        }
    }
}

/// A function pointer resolved from the process's C library. The pointer
/// refers to immutable code, so it is safe to share across threads.
struct RawSym(*mut c_void);

unsafe impl Send for RawSym {}
unsafe impl Sync for RawSym {}

enum Resolution {
    Symbol(RawSym),
    Nr(c_long),
    Missing,
}

struct CFunc {
    op: Op,
    resolution: Resolution,
    failed: fn(c_long) -> bool,
}

impl CFunc {
    fn resolve(op: Op) -> Self {
        for name in op.candidates() {
            // Candidate names are static literals without interior NULs.
            let symbol = CString::new(*name).unwrap();
            let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
            if !addr.is_null() {
                log::debug!("resolved {} to symbol {}", op.name(), name);
                return CFunc {
                    op,
                    resolution: Resolution::Symbol(RawSym(addr)),
                    failed: op.failed(),
                };
            }
        }

        let resolution = match op.fallback_nr() {
            Some(nr) => {
                log::debug!("resolved {} to syscall number {}", op.name(), nr);
                Resolution::Nr(nr)
            }
            None => {
                log::warn!("{} is not available on this system", op.name());
                Resolution::Missing
            }
        };

        CFunc {
            op,
            resolution,
            failed: op.failed(),
        }
    }
}

/// The registry of wrapped C functions, resolved once at startup.
pub struct SyscallTable {
    entries: Vec<CFunc>,
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallTable {
    pub fn new() -> Self {
        let entries = Op::ALL.iter().map(|op| CFunc::resolve(*op)).collect();
        SyscallTable { entries }
    }

    fn entry(&self, op: Op) -> &CFunc {
        // entries are resolved in Op::ALL order, which matches the
        // discriminant order
        &self.entries[op as usize]
    }

    /// Names of the operations that resolved, sorted.
    pub fn available_functions(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .entries
            .iter()
            .filter(|e| !matches!(e.resolution, Resolution::Missing))
            .map(|e| e.op.name())
            .collect();
        names.sort_unstable();
        names
    }

    /// Invoke an operation and report failure through the entry's failure
    /// predicate and the thread's errno.
    pub fn invoke(&self, op: Op, args: &[Arg]) -> Result<c_long> {
        let (res, errno) = self.invoke_raw(op, args)?;
        let entry = self.entry(op);
        if (entry.failed)(res) {
            return Err(Error::OsCall {
                name: entry.op.name(),
                errno,
            });
        }
        Ok(res)
    }

    /// Invoke an operation and return the raw result together with the
    /// errno value observed right after the call, without applying the
    /// failure predicate. Used by callers that interpret errno themselves.
    pub fn invoke_raw(&self, op: Op, args: &[Arg]) -> Result<(c_long, Errno)> {
        let entry = self.entry(op);
        let raw: Vec<usize> = args.iter().map(Arg::to_raw).collect();

        let res = match &entry.resolution {
            Resolution::Symbol(sym) => unsafe { call_symbol(sym, &raw) },
            Resolution::Nr(nr) => unsafe { call_syscall(*nr, &raw) },
            Resolution::Missing => return Err(Error::FunctionUnavailable(entry.op.name())),
        };
        Ok((res, Errno::last()))
    }

    pub fn unshare(&self, flags: c_int) -> Result<()> {
        self.invoke(Op::Unshare, &[Arg::Int(flags)]).map(drop)
    }

    pub fn setns(&self, fd: c_int, nstype: c_int) -> Result<()> {
        self.invoke(Op::Setns, &[Arg::Int(fd), Arg::Int(nstype)])
            .map(drop)
    }

    pub fn mount(
        &self,
        source: Option<&str>,
        target: Option<&Path>,
        fstype: Option<&str>,
        flags: c_long,
        data: Option<&str>,
    ) -> Result<()> {
        let args = [
            Arg::OptStr(source.map(cstring).transpose()?),
            Arg::OptStr(target.map(cstring_path).transpose()?),
            Arg::OptStr(fstype.map(cstring).transpose()?),
            Arg::Long(flags),
            Arg::OptStr(data.map(cstring).transpose()?),
        ];
        self.invoke(Op::Mount, &args).map(drop)
    }

    pub fn umount(&self, target: &Path) -> Result<()> {
        self.invoke(Op::Umount, &[Arg::Str(cstring_path(target)?)])
            .map(drop)
    }

    pub fn umount2(&self, target: &Path, flags: c_int) -> Result<()> {
        self.invoke(
            Op::Umount2,
            &[Arg::Str(cstring_path(target)?), Arg::Int(flags)],
        )
        .map(drop)
    }

    pub fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()> {
        self.invoke(
            Op::PivotRoot,
            &[
                Arg::Str(cstring_path(new_root)?),
                Arg::Str(cstring_path(put_old)?),
            ],
        )
        .map(drop)
    }

    pub fn gethostname(&self) -> Result<String> {
        let mut buf = vec![0u8; HOST_NAME_MAX];
        self.invoke(
            Op::Gethostname,
            &[
                Arg::Ptr(buf.as_mut_ptr() as *mut c_void),
                Arg::Size(buf.len()),
            ],
        )?;
        Ok(nul_terminated(&buf))
    }

    pub fn sethostname(&self, hostname: &str) -> Result<()> {
        self.invoke(
            Op::Sethostname,
            &[Arg::Str(cstring(hostname)?), Arg::Size(hostname.len())],
        )
        .map(drop)
    }

    pub fn getdomainname(&self) -> Result<String> {
        let mut buf = vec![0u8; HOST_NAME_MAX];
        self.invoke(
            Op::Getdomainname,
            &[
                Arg::Ptr(buf.as_mut_ptr() as *mut c_void),
                Arg::Size(buf.len()),
            ],
        )?;
        Ok(nul_terminated(&buf))
    }

    pub fn setdomainname(&self, domainname: &str) -> Result<()> {
        self.invoke(
            Op::Setdomainname,
            &[Arg::Str(cstring(domainname)?), Arg::Size(domainname.len())],
        )
        .map(drop)
    }

    pub fn sched_getcpu(&self) -> Result<i32> {
        self.invoke(Op::SchedGetcpu, &[]).map(|res| res as i32)
    }

    /// Register fork handlers with the C library. Each handler is recorded
    /// in the process-global list and handed to the kernel at most once;
    /// re-registering an already known handler is a no-op for the list but
    /// the underlying call is still made with the full triple, matching
    /// `pthread_atfork(3)` semantics.
    pub fn atfork(
        &self,
        prepare: Option<extern "C" fn()>,
        parent: Option<extern "C" fn()>,
        child: Option<extern "C" fn()>,
    ) -> Result<()> {
        {
            let mut handlers = FORK_HANDLERS.lock().unwrap();
            for handler in [prepare, parent, child].iter().flatten() {
                let addr = *handler as usize;
                if !handlers.contains(&addr) {
                    handlers.push(addr);
                }
            }
        }

        let as_ptr =
            |f: Option<extern "C" fn()>| f.map_or(ptr::null_mut(), |f| f as *mut c_void);
        self.invoke(
            Op::Atfork,
            &[
                Arg::Ptr(as_ptr(prepare)),
                Arg::Ptr(as_ptr(parent)),
                Arg::Ptr(as_ptr(child)),
            ],
        )
        .map(drop)
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::Argument(format!("{:?} contains an interior NUL byte", s)))
}

fn cstring_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Argument(format!("{:?} contains an interior NUL byte", path)))
}

fn nul_terminated(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// All wrapped library functions return `int` in the C ABI, so the call
/// goes through an `extern "C" fn(..) -> c_int` shape of the right arity
/// and the result is widened afterwards.
unsafe fn call_symbol(sym: &RawSym, raw: &[usize]) -> c_long {
    let p = sym.0;
    let res: c_int = match raw {
        [] => mem::transmute::<_, extern "C" fn() -> c_int>(p)(),
        [a] => mem::transmute::<_, extern "C" fn(usize) -> c_int>(p)(*a),
        [a, b] => mem::transmute::<_, extern "C" fn(usize, usize) -> c_int>(p)(*a, *b),
        [a, b, c] => {
            mem::transmute::<_, extern "C" fn(usize, usize, usize) -> c_int>(p)(*a, *b, *c)
        }
        [a, b, c, d] => mem::transmute::<_, extern "C" fn(usize, usize, usize, usize) -> c_int>(
            p,
        )(*a, *b, *c, *d),
        [a, b, c, d, e] => mem::transmute::<
            _,
            extern "C" fn(usize, usize, usize, usize, usize) -> c_int,
        >(p)(*a, *b, *c, *d, *e),
        // no registered operation takes more than five arguments
        _ => unreachable!(),
    };
    c_long::from(res)
}

unsafe fn call_syscall(nr: c_long, raw: &[usize]) -> c_long {
    match raw {
        [] => libc::syscall(nr),
        [a] => libc::syscall(nr, *a),
        [a, b] => libc::syscall(nr, *a, *b),
        [a, b, c] => libc::syscall(nr, *a, *b, *c),
        [a, b, c, d] => libc::syscall(nr, *a, *b, *c, *d),
        [a, b, c, d, e] => libc::syscall(nr, *a, *b, *c, *d, *e),
        // no registered operation takes more than five arguments
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_functions_resolve() {
        let table = SyscallTable::new();
        let available = table.available_functions();
        for name in &["unshare", "mount", "umount2", "setns", "sched_getcpu"] {
            assert!(available.contains(name), "{} did not resolve", name);
        }
    }

    #[test]
    fn test_pivot_root_resolves_through_syscall_number() {
        let table = SyscallTable::new();
        assert!(table.available_functions().contains(&"pivot_root"));
    }

    #[test]
    fn test_available_functions_sorted() {
        let table = SyscallTable::new();
        let available = table.available_functions();
        let mut sorted = available.clone();
        sorted.sort_unstable();
        assert_eq!(available, sorted);
    }

    #[test]
    fn test_sched_getcpu() {
        let table = SyscallTable::new();
        assert!(table.sched_getcpu().unwrap() >= 0);
    }

    #[test]
    fn test_gethostname_matches_kernel() {
        let table = SyscallTable::new();
        let ours = table.gethostname().unwrap();

        let mut buf = [0u8; HOST_NAME_MAX];
        let theirs = nix::unistd::gethostname(&mut buf).unwrap();
        assert_eq!(ours, theirs.to_string_lossy());
    }

    #[test]
    fn test_failed_unshare_reports_name_and_errno() {
        let table = SyscallTable::new();
        // -1 is not a valid clone flag combination.
        let err = table.unshare(-1).unwrap_err();
        match err {
            Error::OsCall { name, .. } => assert_eq!(name, "unshare"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_interior_nul_rejected() {
        let table = SyscallTable::new();
        assert!(matches!(
            table.sethostname("a\0b"),
            Err(Error::Argument(_))
        ));
    }
}
