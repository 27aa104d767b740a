use std::{
    ffi::OsString,
    path::PathBuf,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use forksrv::{ForkServer, ForkServerOptions, Input};
use nix::sys::signal::Signal;
use tracing::{info, warn};

/// Spawn a target through the fork server and drive it for a fixed number of
/// iterations.
///
/// This is a demonstration harness, not a fuzzer: it sends the same input on
/// every iteration. Input generation, coverage feedback, and crash
/// classification are out of scope for this crate (see the design notes).
#[derive(Debug, clap::Parser)]
pub(super) struct RunCommand {
    /// Path to the target executable.
    target: PathBuf,

    /// Arguments to pass to the target.
    #[clap(long = "arg")]
    target_args: Vec<OsString>,

    /// Extra environment variables for the target, as `KEY=VALUE` pairs.
    #[clap(long = "env", value_parser = parse_env_pair)]
    target_envs: Vec<(OsString, OsString)>,

    /// Path to the preloaded interposer library (the `forksrv_interposer`
    /// cdylib, e.g. `target/debug/libforksrv_interposer.so`).
    #[clap(long)]
    interposer: PathBuf,

    /// Feed the input through stdin instead of a file argument.
    #[clap(long)]
    stdin_input: bool,

    /// Memory limit for the target, in MiB. `0` disables the limit.
    #[clap(long, default_value_t = 0)]
    memlimit_mb: u64,

    /// How long to wait for the fork server's hello before giving up, in
    /// milliseconds. `GET_STATUS` itself has no timeout (section 5): the
    /// caller is expected to `SIGKILL` the server if a child never reaps.
    #[clap(long, default_value_t = 10_000)]
    handshake_timeout_ms: u64,

    /// Number of fork/run iterations to perform.
    #[clap(long, default_value_t = 1)]
    iterations: u32,

    /// Signal to send to a child that times out.
    #[clap(long, default_value_t = Signal::SIGKILL)]
    kill_signal: Signal,

    /// Show the target's stdout/stderr instead of discarding them.
    #[clap(long)]
    debug_child: bool,
}

fn parse_env_pair(s: &str) -> Result<(OsString, OsString), anyhow::Error> {
    let (key, value) = s.split_once('=').context("Expected KEY=VALUE")?;
    Ok((OsString::from_str(key)?, OsString::from_str(value)?))
}

impl RunCommand {
    pub(super) fn run(self) -> anyhow::Result<()> {
        let input_setup = if self.stdin_input {
            Input::Stdin
        } else {
            Input::FileArg
        };

        let mut server = ForkServer::spawn(ForkServerOptions {
            target: self.target,
            args: self.target_args,
            envs: self.target_envs,
            interposer_path: self.interposer,
            input_setup,
            memlimit_mb: self.memlimit_mb,
            persistent_max_cnt: None,
            debug_output: self.debug_child,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            kill_signal: self.kill_signal,
        })
        .context("Spawning fork server")?;

        info!(server_pid = %server.server_pid(), "fork server ready");

        let interrupted = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
            .context("Installing Ctrl-C handler")?;

        for iteration in 0..self.iterations {
            if interrupted.load(Ordering::SeqCst) {
                warn!(iteration, "interrupted, stopping early");
                break;
            }
            let pid = server.fork_run().context("Sending FORK_RUN")?;
            let status = server.get_status(true).context("Reading GET_STATUS")?;
            summarize(iteration, pid.as_raw(), status);
        }

        server.exit().context("Sending EXIT")?;
        Ok(())
    }
}

fn summarize(iteration: u32, pid: i32, status: i32) {
    if libc::WIFEXITED(status) {
        info!(iteration, pid, exit_code = libc::WEXITSTATUS(status), "child exited");
    } else if libc::WIFSIGNALED(status) {
        warn!(iteration, pid, signal = libc::WTERMSIG(status), "child was signaled");
    } else {
        warn!(iteration, pid, status, "child stopped in an unexpected state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn env_pair_splits_on_the_first_equals() {
        let (key, value) = parse_env_pair("FORKSRV_PERSISTENT_MAX_CNT=100=x").unwrap();
        assert_eq!(key, OsString::from("FORKSRV_PERSISTENT_MAX_CNT"));
        assert_eq!(value, OsString::from("100=x"));
    }

    #[test]
    fn env_pair_without_equals_is_rejected() {
        assert!(parse_env_pair("NOEQUALS").is_err());
    }

    #[test]
    fn run_command_parses_an_interposer_path_under_a_temp_dir() {
        let interposer_dir = tempfile::tempdir().expect("creating a temp dir");
        let interposer_path = interposer_dir.path().join("libforksrv_interposer.so");

        let cmd = RunCommand::try_parse_from([
            "run",
            "/bin/true",
            "--interposer",
            interposer_path.to_str().unwrap(),
            "--iterations",
            "3",
        ])
        .expect("parsing a well-formed command line");

        assert_eq!(cmd.target, PathBuf::from("/bin/true"));
        assert_eq!(cmd.interposer, interposer_path);
        assert_eq!(cmd.iterations, 3);
    }
}
