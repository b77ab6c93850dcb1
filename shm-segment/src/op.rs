//! Interact with other processes of the same host.
//!
//! The segment is an anonymous file. It has no name in any file system, but every process that
//! holds it has a descriptor for it, and Linux lets a sufficiently privileged peer re-open that
//! descriptor through `/proc/<pid>/fd/<fd>`.
use std::io;
use std::path::PathBuf;

/// The path under which descriptor `fd` of process `pid` can be opened again.
pub fn fd_path(pid: u32, fd: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/fd/{fd}"))
}

/// Check if a process with this id is still running.
///
/// A process that exists but which we are not permitted to signal counts as alive.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };

    // Zero and negative values address process groups, not a process.
    if pid <= 0 {
        return false;
    }

    // Safety: signal 0 performs only the existence and permission checks.
    if 0 == unsafe { libc::kill(pid, 0) } {
        return true;
    }

    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Check if descriptor `fd` of process `pid` is still open on a file of `len` bytes.
///
/// A pid can be reused after its process exits, so liveness alone does not prove that a record
/// is current. Descriptors we are not permitted to inspect are assumed to match.
pub fn holds_file(pid: u32, fd: i32, len: usize) -> bool {
    if !is_alive(pid) {
        return false;
    }

    match std::fs::metadata(fd_path(pid, fd)) {
        Ok(meta) => u64::try_from(len).ok() == Some(meta.len()),
        Err(err) => err.kind() == io::ErrorKind::PermissionDenied,
    }
}

pub fn current_pid() -> u32 {
    std::process::id()
}

#[test]
fn own_process_is_alive() {
    assert!(is_alive(current_pid()));
    assert!(!is_alive(0));
    assert!(!is_alive(u32::MAX));
}

#[test]
fn reaped_child_is_dead() {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("to spawn `true`");
    let pid = child.id();
    child.wait().expect("to reap the child");
    assert!(!is_alive(pid));
}

#[test]
fn held_file_must_match() {
    use std::os::unix::io::AsRawFd;

    let file = tempfile::tempfile().expect("to create a file");
    file.set_len(64).expect("to size the file");
    let fd = file.as_raw_fd();

    assert!(holds_file(current_pid(), fd, 64));
    assert!(!holds_file(current_pid(), fd, 65));
    assert!(!holds_file(current_pid(), -1, 64));
    assert!(!holds_file(u32::MAX, fd, 64));
}
