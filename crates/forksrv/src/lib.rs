//! Fuzzer-side half of a forkserver-based execution harness.
//!
//! This crate implements the driver described in sections 4.4-4.6 of the
//! design: [`Spawner`](spawner) launches the target with the
//! `forksrv-interposer` library preloaded, [`Handshake`](handshake) waits for
//! its hello, and [`ForkServer`] drives the steady-state fork/run/get-status
//! protocol.

pub mod client;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod spawner;

use std::{
    io,
    path::Path,
    process::Child,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use os_pipe::{PipeReader, PipeWriter};
use tracing::{debug, warn};

use client::StatusCache;
use error::{ForkserverError, HandshakeError, ProtocolError, SpawnError};
use protocol::Command;
use spawner::{InputSetup, SpawnOptions, Spawned};
use tempfile::NamedTempFile;

/// A live forkserver handle: one per target process under fuzzing.
///
/// Mirrors the data model in spec section 3 - `fuzzer_to_server` /
/// `server_to_fuzzer` are the two pipe endpoints, `server_pid` identifies the
/// in-target server, `sent_get_status`/`last_status` are the idempotent
/// status cache.
#[derive(Debug)]
pub struct ForkServer {
    child: Child,
    fuzzer_to_server: PipeWriter,
    server_to_fuzzer: PipeReader,
    target_stdin: Option<NamedTempFile>,
    status_cache: StatusCache,
    /// Pid of the most recently forked child. See DESIGN.md for the
    /// single-scratch-variable restriction inherited from the original.
    child_pid: Option<Pid>,
    kill_signal: Signal,
}

/// Options for [`ForkServer::spawn`].
#[derive(Debug)]
pub struct ForkServerOptions {
    pub target: std::path::PathBuf,
    pub args: Vec<std::ffi::OsString>,
    pub envs: Vec<(std::ffi::OsString, std::ffi::OsString)>,
    pub interposer_path: std::path::PathBuf,
    pub input_setup: InputSetup,
    pub memlimit_mb: u64,
    pub persistent_max_cnt: Option<u32>,
    pub debug_output: bool,
    pub handshake_timeout: Duration,
    pub kill_signal: Signal,
}

impl ForkServer {
    /// Spawn the target and complete the handshake. On success the server is
    /// ready to accept `FORK`/`FORK_RUN`/`RUN`/`GET_STATUS`/`EXIT`.
    pub fn spawn(options: ForkServerOptions) -> Result<Self, ForkserverError> {
        let Spawned {
            child,
            mut rx,
            tx,
            stdin_file,
        } = spawner::spawn(SpawnOptions {
            target: options.target,
            args: options.args,
            envs: options.envs,
            interposer_path: options.interposer_path,
            input_setup: options.input_setup,
            memlimit_mb: options.memlimit_mb,
            persistent_max_cnt: options.persistent_max_cnt,
            debug_output: options.debug_output,
        })?;

        let mut child = child;
        handshake::wait_for_hello(
            &mut rx,
            &mut child,
            options.handshake_timeout,
            options.memlimit_mb,
        )?;

        Ok(Self {
            child,
            fuzzer_to_server: tx,
            server_to_fuzzer: rx,
            target_stdin: stdin_file,
            status_cache: StatusCache::default(),
            child_pid: None,
            kill_signal: options.kill_signal,
        })
    }

    /// Pid of the in-target server process (the first child of this driver).
    pub fn server_pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Path to the stdin temp file, when [`InputSetup::Stdin`] was used.
    pub fn stdin_path(&self) -> Option<&Path> {
        self.target_stdin.as_ref().map(|f| f.path())
    }

    /// Send `FORK`: the new child blocks on the gate until [`Self::run`].
    pub fn fork(&mut self) -> Result<Pid, ProtocolError> {
        let pid = client::fork(&mut self.fuzzer_to_server, &mut self.server_to_fuzzer, Command::Fork)?;
        self.child_pid = Some(pid);
        self.status_cache = StatusCache::default();
        Ok(pid)
    }

    /// Send `FORK_RUN`: the new child runs immediately, no gate.
    pub fn fork_run(&mut self) -> Result<Pid, ProtocolError> {
        let pid = client::fork(
            &mut self.fuzzer_to_server,
            &mut self.server_to_fuzzer,
            Command::ForkRun,
        )?;
        self.child_pid = Some(pid);
        self.status_cache = StatusCache::default();
        Ok(pid)
    }

    /// Send `RUN`, releasing a child gated by a previous [`Self::fork`].
    pub fn run(&mut self) -> Result<(), ProtocolError> {
        client::run(&mut self.fuzzer_to_server, &mut self.server_to_fuzzer)
    }

    /// Fetch the wait-status of the most recently forked child.
    ///
    /// If `wait` is `false` and the status is not yet available, returns
    /// [`ProtocolError::NotReady`] without blocking. The underlying
    /// `GET_STATUS` is sent at most once until its response is consumed, even
    /// across repeated nonblocking polls.
    pub fn get_status(&mut self, wait: bool) -> Result<i32, ProtocolError> {
        let status = client::get_status(
            &mut self.fuzzer_to_server,
            &mut self.server_to_fuzzer,
            &mut self.status_cache,
            wait,
        )?;
        if !libc::WIFSTOPPED(status) {
            self.child_pid = None;
        }
        Ok(status)
    }

    /// Send `EXIT` and drop the pipe endpoints this handle owns.
    pub fn exit(mut self) -> Result<(), ProtocolError> {
        client::exit(&mut self.fuzzer_to_server)
    }

    /// Convenience: raw handshake timeout constant used by the default
    /// configuration (spec section 4.5).
    pub fn default_handshake_timeout() -> Duration {
        handshake::STARTUP_TIMEOUT
    }
}

impl Drop for ForkServer {
    fn drop(&mut self) {
        if let Some(pid) = self.child_pid.take() {
            debug!(%pid, "sending {} to gated/running child", self.kill_signal);
            match signal::kill(pid, self.kill_signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => warn!(%err, "failed to deliver kill signal to child"),
            }
        }

        if let Err(err) = self.child.kill() {
            if err.kind() != io::ErrorKind::InvalidInput {
                warn!(%err, "failed to kill fork server process");
            }
        }
        if let Err(err) = self.child.wait() {
            warn!(%err, "failed to wait for fork server process");
        }
    }
}

pub use error::ForkserverError as Error;
pub use spawner::InputSetup as Input;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_byte_roundtrip() {
        for command in [
            Command::Exit,
            Command::Fork,
            Command::ForkRun,
            Command::Run,
            Command::GetStatus,
        ] {
            assert_eq!(Command::from_byte(command.as_byte()), Some(command));
        }
    }

    #[test]
    fn unknown_command_byte_is_none() {
        assert_eq!(Command::from_byte(0), None);
    }

    #[test]
    fn hello_is_the_fixed_afl_constant() {
        assert_eq!(u32::from_ne_bytes(protocol::HELLO), 0x4141_4141);
    }
}
