//! Privilege-lowering startup sequence: require root, install signal
//! handlers, daemonize, open sockets, then chroot and drop to an
//! unprivileged user before the reactor ever touches a client byte.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::unistd::{self, Uid, User};
use tracing::info;

use crate::error::{Result, TftpError};
use crate::net::{self, Family};

/// Signals ignored process-wide for the life of the daemon, installed
/// before fork so the disposition survives into the child.
const IGNORED_SIGNALS: [libc::c_int; 7] = [
    libc::SIGINT,
    libc::SIGPIPE,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
];

pub fn require_root() -> Result<()> {
    if !Uid::effective().is_root() {
        return Err(TftpError::Tftp("must be run as root".into()));
    }
    Ok(())
}

/// Sets the ignore-list signals to `SIG_IGN` via raw `signal(2)`. Must
/// run before fork so the disposition is inherited by the daemon child.
pub fn ignore_background_signals() {
    for &sig in &IGNORED_SIGNALS {
        unsafe {
            libc::signal(sig, libc::SIG_IGN);
        }
    }
}

/// Spawns small tasks that set `shutdown` on SIGTERM, SIGQUIT, or
/// SIGHUP. Must run after the Tokio runtime is active.
pub fn install_shutdown_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [SignalKind::terminate(), SignalKind::quit(), SignalKind::hangup()] {
        let mut stream = signal(kind).map_err(|e| TftpError::Tftp(format!("signal install failed: {e}")))?;
        let flag = shutdown.clone();
        tokio::spawn(async move {
            stream.recv().await;
            info!("shutdown signal received");
            flag.store(true, Ordering::Relaxed);
        });
    }
    Ok(())
}

/// Forks, detaches from the controlling terminal, and redirects the
/// standard streams to `/dev/null`. Runs before the logging subsystem
/// is installed, since its non-blocking writer spawns a thread that
/// would not survive the fork. No-op if `foreground` is set.
pub fn daemonize(foreground: bool) -> Result<()> {
    if foreground {
        return Ok(());
    }
    // SAFETY: single-threaded at this point in startup, before the
    // Tokio runtime or any other threads exist.
    unsafe {
        match unistd::fork().map_err(|e| TftpError::Tftp(format!("fork failed: {e}")))? {
            unistd::ForkResult::Parent { .. } => std::process::exit(0),
            unistd::ForkResult::Child => {}
        }
    }
    unistd::setsid().map_err(|e| TftpError::Tftp(format!("setsid failed: {e}")))?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| TftpError::Tftp(format!("failed to open /dev/null: {e}")))?;
    use std::os::unix::io::AsRawFd;
    let fd = devnull.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        unsafe {
            libc::dup2(fd, target);
        }
    }
    unsafe {
        libc::umask(0);
    }
    Ok(())
}

/// Looks up `username`'s uid/gid before the chroot makes `/etc/passwd`
/// unreachable.
pub fn lookup_user(username: &str) -> Result<User> {
    User::from_name(username)
        .map_err(|e| TftpError::Tftp(format!("user lookup failed: {e}")))?
        .ok_or_else(|| TftpError::Tftp(format!("no such user: {username}")))
}

/// Changes root to `datastore_root` and chdirs into it.
pub fn chroot_to_datastore(datastore_root: &Path) -> Result<()> {
    unistd::chroot(datastore_root)
        .map_err(|e| TftpError::Tftp(format!("chroot to {} failed: {e}", datastore_root.display())))?;
    unistd::chdir("/").map_err(|e| TftpError::Tftp(format!("chdir failed: {e}")))?;
    Ok(())
}

/// Drops privileges to `user`: setgid, initgroups, then setuid, in that
/// order (setuid must be last, or the process can no longer change its
/// group afterward).
pub fn drop_privileges(user: &User) -> Result<()> {
    unistd::setgid(user.gid).map_err(|e| TftpError::Tftp(format!("setgid failed: {e}")))?;
    unistd::initgroups(
        &std::ffi::CString::new(user.name.as_str()).expect("username has no interior nul"),
        user.gid,
    )
    .map_err(|e| TftpError::Tftp(format!("initgroups failed: {e}")))?;
    unistd::setuid(user.uid).map_err(|e| TftpError::Tftp(format!("setuid failed: {e}")))?;
    Ok(())
}

/// Resolves the datastore root to an absolute, canonical path before
/// the chroot call (relative paths are meaningless once rooted).
pub fn resolve_datastore_path(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path)
        .map_err(|e| TftpError::Tftp(format!("datastore path {} invalid: {e}", path.display())))
}

/// Creates the listening sockets requested by `families`, before the
/// chroot and privilege drop (binding port 69 requires root).
pub fn create_listeners(families: &[Family], iface: Option<&str>) -> Result<Vec<tokio::net::UdpSocket>> {
    let mut sockets = Vec::with_capacity(families.len());
    for &family in families {
        let addr = match iface {
            Some(ifname) => Some(net::resolve_interface_address(ifname, family)?),
            None => None,
        };
        sockets.push(net::bind_listener(family, addr)?);
    }
    Ok(sockets)
}
