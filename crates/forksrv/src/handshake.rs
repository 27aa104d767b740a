//! Bounded wait for the server's hello, with failure classification.

use std::{
    io::Read,
    os::fd::AsRawFd,
    process::Child,
    time::{Duration, Instant},
};

use os_pipe::PipeReader;
use tracing::{info, warn};

use crate::{error::HandshakeError, protocol};

/// How long the driver waits for the hello before giving up.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep between polls of the status pipe.
const POLL_INTERVAL: Duration = Duration::from_micros(5);

/// Poll `rx` for the 4-byte hello for up to `timeout`, reaping `child` and
/// classifying the failure if it exits or the wait times out.
pub fn wait_for_hello(
    rx: &mut PipeReader,
    child: &mut Child,
    timeout: Duration,
    memlimit_mb: u64,
) -> Result<(), HandshakeError> {
    let deadline = Instant::now() + timeout;

    loop {
        let available = bytes_available(rx)?;
        if available >= protocol::HELLO.len() {
            let mut hello = [0_u8; 4];
            rx.read_exact(&mut hello)?;
            info!("fork server hello received");
            return Ok(());
        }

        if let Some(status) = try_reap(child)? {
            return Err(classify_silent_exit(status, memlimit_mb));
        }

        if Instant::now() >= deadline {
            warn!("fork server did not respond within the startup timeout, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(HandshakeError::Timeout);
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn bytes_available(rx: &PipeReader) -> std::io::Result<usize> {
    let fd = rx.as_raw_fd();
    let mut available: libc::c_int = 0;
    // SAFETY: `fd` is open and valid for the duration of this call, and
    // `available` is a valid `c_int` the kernel can write into.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(available.max(0) as usize)
}

fn try_reap(child: &mut Child) -> std::io::Result<Option<std::process::ExitStatus>> {
    child.try_wait()
}

fn classify_silent_exit(
    status: std::process::ExitStatus,
    memlimit_mb: u64,
) -> HandshakeError {
    use std::os::unix::process::ExitStatusExt;

    let was_signaled = status.signal().is_some();
    match (was_signaled, memlimit_mb) {
        (true, 0) => HandshakeError::CrashNoMemoryLimit,
        (true, memlimit_mb) if memlimit_mb < 10 => {
            HandshakeError::CrashMemoryLimitTooLow { memlimit_mb }
        }
        (true, memlimit_mb) => HandshakeError::CrashSuspectedMemoryLimitAndSanitizer {
            memlimit_mb,
        },
        (false, _) => HandshakeError::SilentExit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn status_of(mut cmd: Command) -> std::process::ExitStatus {
        cmd.status().expect("spawning helper process")
    }

    #[test]
    fn clean_exit_with_no_limit_classifies_as_silent_exit() {
        let status = status_of(Command::new("/bin/true"));
        assert!(matches!(classify_silent_exit(status, 0), HandshakeError::SilentExit));
    }

    #[test]
    fn signal_with_no_memory_limit_blames_something_other_than_memory() {
        let status = status_of(Command::new("/bin/sh").args(["-c", "kill -ABRT $$"]));
        assert!(matches!(
            classify_silent_exit(status, 0),
            HandshakeError::CrashNoMemoryLimit
        ));
    }

    #[test]
    fn signal_with_tiny_memory_limit_blames_the_limit() {
        let status = status_of(Command::new("/bin/sh").args(["-c", "kill -ABRT $$"]));
        assert!(matches!(
            classify_silent_exit(status, 4),
            HandshakeError::CrashMemoryLimitTooLow { memlimit_mb: 4 }
        ));
    }

    #[test]
    fn signal_with_generous_memory_limit_suspects_a_sanitizer() {
        let status = status_of(Command::new("/bin/sh").args(["-c", "kill -ABRT $$"]));
        assert!(matches!(
            classify_silent_exit(status, 256),
            HandshakeError::CrashSuspectedMemoryLimitAndSanitizer { memlimit_mb: 256 }
        ));
    }
}
