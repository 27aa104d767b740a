//! Steady-state command/response protocol (C6): send one command, read
//! exactly one response, with a small cache so `GET_STATUS` can be polled
//! nonblockingly without re-sending it.

use std::io::{Read, Write};

use nix::unistd::Pid;
use os_pipe::{PipeReader, PipeWriter};
use tracing::debug;

use crate::{error::ProtocolError, protocol::Command};

/// Cached outcome of an in-flight `GET_STATUS`.
#[derive(Debug, Default)]
pub(crate) struct StatusCache {
    pub(crate) sent: bool,
    pub(crate) last: Option<i32>,
}

pub(crate) fn send_command(tx: &mut PipeWriter, command: Command) -> Result<(), ProtocolError> {
    let byte = [command.as_byte()];
    let written = tx.write(&byte)?;
    if written != 1 {
        return Err(ProtocolError::ShortWrite {
            expected: 1,
            got: written,
        });
    }
    debug!(?command, "sent command");
    Ok(())
}

pub(crate) fn read_response(rx: &mut PipeReader) -> Result<i32, ProtocolError> {
    let mut buf = [0_u8; 4];
    rx.read_exact(&mut buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ShortRead {
                expected: 4,
                got: 0,
            }
        } else {
            ProtocolError::Io(err)
        }
    })?;
    Ok(i32::from_ne_bytes(buf))
}

/// Send `FORK` or `FORK_RUN` and read back the new child's pid.
pub(crate) fn fork(
    tx: &mut PipeWriter,
    rx: &mut PipeReader,
    command: Command,
) -> Result<Pid, ProtocolError> {
    debug_assert!(matches!(command, Command::Fork | Command::ForkRun));
    send_command(tx, command)?;
    let pid = read_response(rx)?;
    if pid <= 0 {
        return Err(ProtocolError::InvalidPid(pid));
    }
    Ok(Pid::from_raw(pid))
}

/// Send `RUN` and require the `0` acknowledgement.
pub(crate) fn run(tx: &mut PipeWriter, rx: &mut PipeReader) -> Result<(), ProtocolError> {
    send_command(tx, Command::Run)?;
    let ack = read_response(rx)?;
    if ack != 0 {
        return Err(ProtocolError::UnexpectedRunAck(ack as u32));
    }
    Ok(())
}

/// Implements the `GET_STATUS` idempotent-cache semantics from spec 4.6:
/// send at most once until the response is consumed, poll nonblockingly if
/// requested.
pub(crate) fn get_status(
    tx: &mut PipeWriter,
    rx: &mut PipeReader,
    cache: &mut StatusCache,
    wait: bool,
) -> Result<i32, ProtocolError> {
    if let Some(status) = cache.last {
        return Ok(status);
    }

    if !cache.sent {
        send_command(tx, Command::GetStatus)?;
        cache.sent = true;
    }

    if !wait {
        let available = bytes_available(rx)?;
        if available < 4 {
            return Err(ProtocolError::NotReady);
        }
    }

    let status = read_response(rx)?;
    cache.last = Some(status);
    cache.sent = false;
    Ok(status)
}

fn bytes_available(rx: &PipeReader) -> Result<usize, ProtocolError> {
    use std::os::fd::AsRawFd;

    let fd = rx.as_raw_fd();
    let mut available: libc::c_int = 0;
    // SAFETY: `fd` is open and valid for the duration of this call, and
    // `available` is a valid `c_int` the kernel can write into.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
    if ret < 0 {
        return Err(ProtocolError::Io(std::io::Error::last_os_error()));
    }
    Ok(available.max(0) as usize)
}

/// Send `EXIT`. There is no response to read.
pub(crate) fn exit(tx: &mut PipeWriter) -> Result<(), ProtocolError> {
    send_command(tx, Command::Exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_status_is_not_ready_until_a_response_is_written() {
        let (mut driver_tx, mut server_rx) = os_pipe::pipe().unwrap();
        let (mut server_tx, mut driver_rx) = os_pipe::pipe().unwrap();
        let mut cache = StatusCache::default();

        let err = get_status(&mut driver_tx, &mut driver_rx, &mut cache, false).unwrap_err();
        assert!(matches!(err, ProtocolError::NotReady));
        assert!(cache.sent, "GET_STATUS must be sent exactly once");

        // Drain the command byte the server side would have read.
        let mut command_byte = [0_u8; 1];
        server_rx.read_exact(&mut command_byte).unwrap();
        assert_eq!(command_byte[0], Command::GetStatus.as_byte());

        // A second nonblocking poll before the server answers must not
        // resend GET_STATUS.
        let err = get_status(&mut driver_tx, &mut driver_rx, &mut cache, false).unwrap_err();
        assert!(matches!(err, ProtocolError::NotReady));

        server_tx.write_all(&42_i32.to_ne_bytes()).unwrap();
        let status = get_status(&mut driver_tx, &mut driver_rx, &mut cache, false).unwrap();
        assert_eq!(status, 42);
    }

    #[test]
    fn get_status_caches_the_response_across_repeated_calls() {
        let (mut driver_tx, mut server_rx) = os_pipe::pipe().unwrap();
        let (mut server_tx, mut driver_rx) = os_pipe::pipe().unwrap();
        let mut cache = StatusCache::default();

        server_tx.write_all(&7_i32.to_ne_bytes()).unwrap();
        let first = get_status(&mut driver_tx, &mut driver_rx, &mut cache, true).unwrap();
        let second = get_status(&mut driver_tx, &mut driver_rx, &mut cache, true).unwrap();
        assert_eq!(first, second);

        // Only one command byte was ever written, even though get_status
        // was called twice.
        let mut command_byte = [0_u8; 1];
        server_rx.read_exact(&mut command_byte).unwrap();
        assert_eq!(
            bytes_available(&server_rx).unwrap(),
            0,
            "a second GET_STATUS must not have been sent while cached"
        );
    }

    #[test]
    fn fork_rejects_a_non_positive_pid() {
        let (mut driver_tx, mut server_rx) = os_pipe::pipe().unwrap();
        let (mut server_tx, mut driver_rx) = os_pipe::pipe().unwrap();

        server_tx.write_all(&(-1_i32).to_ne_bytes()).unwrap();
        let err = fork(&mut driver_tx, &mut driver_rx, Command::Fork).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPid(-1)));

        let mut command_byte = [0_u8; 1];
        server_rx.read_exact(&mut command_byte).unwrap();
        assert_eq!(command_byte[0], Command::Fork.as_byte());
    }
}
