//! OS process helpers: signals, liveness probes, hostname, memory and PID files.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ErrorCode, HiveError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Signals
// ═══════════════════════════════════════════════════════════════════════════════

/// Signals understood by workers and their children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Graceful stop after the current job
    Quit,
    /// Immediate stop
    Term,
    Int,
    Kill,
    /// Cancel the running job
    Usr1,
    /// Pause
    Usr2,
    /// Resume
    Cont,
}

impl Signal {
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            Self::Quit => libc::SIGQUIT,
            Self::Term => libc::SIGTERM,
            Self::Int => libc::SIGINT,
            Self::Kill => libc::SIGKILL,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
            Self::Cont => libc::SIGCONT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Quit => "SIGQUIT",
            Self::Term => "SIGTERM",
            Self::Int => "SIGINT",
            Self::Kill => "SIGKILL",
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
            Self::Cont => "SIGCONT",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `pid` names a live process.
///
/// A process owned by another user (`EPERM`) still counts as alive.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Deliver `signal` to `pid`.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| HiveError::signal_delivery(pid, signal.name(), "invalid pid"))?;

    // SAFETY: plain kill(2) on a positive pid; no memory is shared.
    let rc = unsafe { libc::kill(raw, signal.as_raw()) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return Err(HiveError::signal_delivery(pid, signal.name(), err.to_string()));
    }

    debug!(pid, signal = signal.name(), "Signal sent");
    Ok(())
}

/// Host name of this machine.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        warn!(error = %io::Error::last_os_error(), "gethostname failed");
        return "localhost".to_string();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Resident memory of this process in bytes.
///
/// Current RSS from `/proc/self/statm` where procfs exists; otherwise the peak
/// RSS reported by `getrusage`, which never decreases.
pub fn resident_memory_bytes() -> u64 {
    current_rss_bytes().unwrap_or_else(peak_rss_bytes)
}

fn current_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf only reads a configuration value.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = u64::try_from(page_size).ok().filter(|size| *size > 0)?;
    Some(pages * page_size)
}

fn peak_rss_bytes() -> u64 {
    // SAFETY: rusage is plain data and getrusage fills it completely.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return 0;
    }
    let maxrss = u64::try_from(usage.ru_maxrss).unwrap_or(0);
    if cfg!(target_os = "macos") {
        maxrss
    } else {
        maxrss * 1024
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PID File
// ═══════════════════════════════════════════════════════════════════════════════

/// A PID file owned by this process; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID to `path`.
    ///
    /// Fails if the file names another live process. A stale file is replaced.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let own = std::process::id();

        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if pid != own && pid_alive(pid) {
                    return Err(HiveError::new(
                        ErrorCode::ConfigurationError,
                        format!(
                            "PID file {} belongs to running process {}",
                            path.display(),
                            pid
                        ),
                    ));
                }
            }
            debug!(path = %path.display(), "Replacing stale PID file");
        }

        std::fs::write(&path, format!("{}\n", own))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn test_dead_pid() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
        assert_eq!(
            send_signal(pid, Signal::Usr1).unwrap_err().code(),
            ErrorCode::SignalDeliveryFailed
        );
    }

    #[test]
    fn test_hostname_not_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn test_resident_memory_is_current() {
        assert!(resident_memory_bytes() > 0);
        assert!(peak_rss_bytes() > 0);

        #[cfg(target_os = "linux")]
        assert!(current_rss_bytes().expect("procfs statm") > 0);
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");

        {
            let pid_file = PidFile::create(&path).unwrap();
            let written = std::fs::read_to_string(pid_file.path()).unwrap();
            assert_eq!(written.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_refuses_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");

        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        std::fs::write(&path, child.id().to_string()).unwrap();

        assert!(PidFile::create(&path).is_err());

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(PidFile::create(&path).is_ok());
    }
}
