//! Namespaces that confine a step, entered in the child between `fork` and `exec`.
//!
//! The spawned child unshares user, mount, pid and (unless the step may use the
//! network) network namespaces. The host filesystem is remounted read-only with
//! only the workspace writable. The child then forks twice: the first fork is
//! pid 1 of the new pid namespace, the second execs the program. Both ancestors
//! only wait and relay the exit status, so when the program exits pid 1 exits
//! and the kernel kills whatever is left in the namespace, detached or not.
//!
//! Like `limits`, everything here runs in the forked child: async-signal-safe
//! libc calls only, on data prepared by `Confinement::new`.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// In-namespace id used when the engine itself runs as root, so the program
/// never holds capabilities over its own mounts.
const NOBODY: u32 = 65534;

const MOUNT_ATTR_RDONLY: u64 = 0x1;
const AT_RECURSIVE: libc::c_uint = 0x8000;

/// `struct mount_attr` from `linux/mount.h`.
#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

#[derive(Clone, Debug)]
pub struct Confinement {
    workdir: CString,
    isolate_network: bool,
    required: bool,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl Confinement {
    pub fn new(workdir: &Path, allow_network: bool, required: bool) -> io::Result<Self> {
        let workdir = CString::new(workdir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "workdir contains NUL"))?;
        // SAFETY: getuid and getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Ok(Self {
            workdir,
            isolate_network: !allow_network,
            required,
            uid_map: id_map(uid),
            gid_map: id_map(gid),
        })
    }

    /// Registers the confinement to run in the child. Must be installed before
    /// any other `pre_exec` hook, since only the innermost fork returns from it.
    pub fn install(self, command: &mut tokio::process::Command) {
        // SAFETY: `enter` only performs async-signal-safe syscalls on owned data.
        unsafe {
            command.pre_exec(move || self.enter());
        }
    }

    fn enter(&self) -> io::Result<()> {
        let confined = match self.unshare() {
            Ok(user_namespace) => {
                if user_namespace {
                    self.write_id_maps();
                }
                self.check(self.confine_filesystem())?;
                true
            }
            Err(e) => {
                if self.required {
                    return Err(e);
                }
                false
            }
        };

        // first fork: pid 1 of the new namespace when `confined`
        fork_and_relay()?;
        if confined {
            self.check(mount_proc())?;
        }
        // second fork: the program itself, never pid 1
        fork_and_relay()?;
        Ok(())
    }

    fn check(&self, result: io::Result<()>) -> io::Result<()> {
        match result {
            Err(e) if self.required => Err(e),
            _ => Ok(()),
        }
    }

    /// Returns whether a user namespace was created. Without one the process
    /// needs `CAP_SYS_ADMIN` itself.
    fn unshare(&self) -> io::Result<bool> {
        let mut flags = libc::CLONE_NEWNS | libc::CLONE_NEWPID | libc::CLONE_NEWIPC;
        if self.isolate_network {
            flags |= libc::CLONE_NEWNET;
        }
        // SAFETY: unshare only affects the calling (child) process.
        if unsafe { libc::unshare(flags | libc::CLONE_NEWUSER) } == 0 {
            return Ok(true);
        }
        if unsafe { libc::unshare(flags) } == 0 {
            return Ok(false);
        }
        Err(io::Error::last_os_error())
    }

    /// Best-effort: an unmapped id still leaves the program without capabilities.
    fn write_id_maps(&self) {
        let _ = write_file(c"/proc/self/setgroups", b"deny");
        let _ = write_file(c"/proc/self/uid_map", &self.uid_map);
        let _ = write_file(c"/proc/self/gid_map", &self.gid_map);
    }

    fn confine_filesystem(&self) -> io::Result<()> {
        // mount events must not propagate back to the host
        mount(None, c"/", None, libc::MS_REC | libc::MS_PRIVATE)?;
        let workdir = self.workdir.as_c_str();
        mount(Some(workdir), workdir, None, libc::MS_BIND | libc::MS_REC)?;
        set_read_only(c"/", true)?;
        set_read_only(workdir, false)?;
        // the cwd still points into the mount underneath the bind
        // SAFETY: `workdir` is a valid C string.
        if unsafe { libc::chdir(workdir.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn id_map(id: u32) -> Vec<u8> {
    let inner = if id == 0 { NOBODY } else { id };
    format!("{inner} {id} 1\n").into_bytes()
}

fn mount(
    source: Option<&CStr>,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
) -> io::Result<()> {
    let ptr = |s: Option<&CStr>| s.map_or(std::ptr::null(), CStr::as_ptr);
    // SAFETY: all pointers are null or valid C strings.
    let rc = unsafe {
        libc::mount(
            ptr(source),
            target.as_ptr(),
            ptr(fstype),
            flags,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn mount_proc() -> io::Result<()> {
    mount(
        Some(c"proc"),
        c"/proc",
        Some(c"proc"),
        libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
    )
}

/// Recursively sets or clears the read-only flag with `mount_setattr(2)`.
fn set_read_only(path: &CStr, read_only: bool) -> io::Result<()> {
    let attr = MountAttr {
        attr_set: if read_only { MOUNT_ATTR_RDONLY } else { 0 },
        attr_clr: if read_only { 0 } else { MOUNT_ATTR_RDONLY },
        propagation: 0,
        userns_fd: 0,
    };
    // SAFETY: `attr` outlives the call and its size is passed along.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mount_setattr,
            libc::AT_FDCWD,
            path.as_ptr(),
            AT_RECURSIVE,
            &attr as *const MountAttr,
            std::mem::size_of::<MountAttr>(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn write_file(path: &CStr, content: &[u8]) -> io::Result<()> {
    // SAFETY: `path` is a valid C string; the fd is closed before returning.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, content.as_ptr().cast(), content.len());
        let error = io::Error::last_os_error();
        libc::close(fd);
        if written != content.len() as isize {
            return Err(error);
        }
    }
    Ok(())
}

/// Forks. The child returns, the parent never does: it waits for the child and
/// exits with the same status.
fn fork_and_relay() -> io::Result<()> {
    // SAFETY: the child is single-threaded; both sides only make raw syscalls.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            // SAFETY: plain prctl on the calling process.
            unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) };
            Ok(())
        }
        child => relay(child),
    }
}

fn relay(child: libc::pid_t) -> ! {
    // the exec status pipe of the spawner must only stay open in the program
    close_inherited_fds();

    let mut status = 0;
    loop {
        // SAFETY: `status` is a valid out pointer.
        let rc = unsafe { libc::waitpid(child, &mut status, 0) };
        if rc == child {
            break;
        }
        if rc < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            // SAFETY: terminating the relay is always sound.
            unsafe { libc::_exit(127) };
        }
    }

    // SAFETY: only terminates or signals the calling process.
    unsafe {
        if libc::WIFEXITED(status) {
            libc::_exit(libc::WEXITSTATUS(status));
        }
        let signal = libc::WTERMSIG(status);
        // pid 1 of a namespace ignores its own signals and falls through to the exit
        libc::signal(signal, libc::SIG_DFL);
        libc::kill(libc::getpid(), signal);
        libc::_exit(128 + signal)
    }
}

fn close_inherited_fds() {
    // SAFETY: closing descriptors of the calling process only.
    unsafe {
        if libc::syscall(libc::SYS_close_range, 3 as libc::c_uint, libc::c_uint::MAX, 0) == 0 {
            return;
        }
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let max = if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) == 0 {
            limit.rlim_cur.min(1 << 20) as libc::c_int
        } else {
            1024
        };
        for fd in 3..max {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_map_keeps_unprivileged_id() {
        assert_eq!(id_map(1000), b"1000 1000 1\n");
    }

    #[test]
    fn test_id_map_never_maps_root_to_root() {
        assert_eq!(id_map(0), b"65534 0 1\n");
    }

    #[test]
    fn test_network_follows_limits() {
        let dir = Path::new("/tmp/ws");

        assert!(Confinement::new(dir, false, true).unwrap().isolate_network);
        assert!(!Confinement::new(dir, true, true).unwrap().isolate_network);
    }

    #[test]
    fn test_workdir_with_nul_is_rejected() {
        let dir = Path::new("/tmp/w\0s");

        assert!(Confinement::new(dir, false, true).is_err());
    }
}
