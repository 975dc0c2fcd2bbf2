//! Signalling a worker's whole process tree.
//!
//! On unix every worker leads its own process group. Helpers it forks
//! share the group, so one signal reaches them too and they release the
//! output pipe together with the worker.

use std::process::Command;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Stop {
    /// SIGTERM, so wrappers can forward it to their payload
    Terminate,
    /// SIGKILL
    Kill,
}

/// Make the spawned process the leader of a new process group
#[cfg(unix)]
pub(super) fn isolate(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
pub(super) fn isolate(_command: &mut Command) {}

/// Send `stop` to every process in the group led by `pid`.
///
/// A group that is already gone is not an error.
#[cfg(unix)]
pub(super) fn signal(worker: usize, pid: u32, stop: Stop) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let signal = match stop {
        Stop::Terminate => libc::SIGTERM,
        Stop::Kill => libc::SIGKILL,
    };

    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    if unsafe { libc::kill(-pgid, signal) } != 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!(worker, error = %e, ?stop, "Failed to signal worker group");
        }
    }
}

#[cfg(not(unix))]
pub(super) fn signal(_worker: usize, _pid: u32, _stop: Stop) {}

/// Whether any process of the group led by `pid` is still around
#[cfg(unix)]
pub(super) fn alive(pid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the group exists.
    unsafe { libc::kill(-pgid, 0) == 0 }
}

#[cfg(not(unix))]
pub(super) fn alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    #[test]
    fn terminate_reaches_forked_children() {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg("sleep 30 & wait")
            .stdout(Stdio::piped());
        isolate(&mut command);
        let mut child = command.spawn().unwrap();
        let mut output = child.stdout.take().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(alive(child.id()));

        let started = Instant::now();
        signal(1, child.id(), Stop::Terminate);
        child.wait().unwrap();
        // EOF only once the forked sleep has let go of the pipe too
        let mut rest = Vec::new();
        output.read_to_end(&mut rest).unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn signalling_a_finished_group_is_quiet() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("exit 0");
        isolate(&mut command);
        let mut child = command.spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        signal(1, pid, Stop::Kill);
        assert!(!alive(pid));
    }
}
