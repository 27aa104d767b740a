//! Launches the target with the interposer injected and the control pipes
//! wired up, once per [`crate::ForkServer::spawn`].

use std::{
    ffi::{OsStr, OsString},
    io,
    os::{
        fd::{AsRawFd, FromRawFd, RawFd},
        unix::process::CommandExt,
    },
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use nix::sys::resource::{Resource, setrlimit};
use os_pipe::{PipeReader, PipeWriter};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::{error::SpawnError, protocol};

/// Minimum soft `RLIMIT_NOFILE` the target is raised to before exec, so that
/// pipe bookkeeping never runs the target out of descriptors.
const MIN_NOFILE: u64 = 256;

/// How the fuzz input reaches the target.
#[derive(Debug)]
pub enum InputSetup {
    /// The target reads its input from stdin; the driver keeps a temp file it
    /// can rewrite between iterations.
    Stdin,
    /// The input is passed as a file path argument; no special stdio wiring.
    FileArg,
}

/// Configuration for spawning the initial target process.
#[derive(Debug)]
pub struct SpawnOptions {
    pub target: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    pub interposer_path: PathBuf,
    pub input_setup: InputSetup,
    /// Memory limit in MiB; `0` disables the limit (mirrors the teacher's
    /// stubbed `mem_limit = 0`, see DESIGN.md).
    pub memlimit_mb: u64,
    pub persistent_max_cnt: Option<u32>,
    pub debug_output: bool,
}

/// Everything the handshake/protocol layers need after a successful spawn.
pub struct Spawned {
    pub child: Child,
    pub rx: PipeReader,
    pub tx: PipeWriter,
    pub stdin_file: Option<NamedTempFile>,
}

/// Fork and exec the target with the interposer preloaded and the control
/// pipes dup2'd onto the well-known fds.
pub fn spawn(options: SpawnOptions) -> Result<Spawned, SpawnError> {
    let (rx, child_writer) = os_pipe::pipe().map_err(SpawnError::StatusPipe)?;
    let (child_reader, tx) = os_pipe::pipe().map_err(SpawnError::ControlPipe)?;

    let stdin_file = match options.input_setup {
        InputSetup::Stdin => {
            Some(NamedTempFile::new().map_err(SpawnError::StdinTempFile)?)
        }
        InputSetup::FileArg => None,
    };

    let mut command = Command::new(&options.target);
    command.args(&options.args);

    let stdin: Stdio = match &stdin_file {
        Some(file) => dup_stdio(file.as_file().as_raw_fd())?,
        None => Stdio::null(),
    };
    command.stdin(stdin);

    if options.debug_output {
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    command.env(protocol::PRELOAD_ENV, &options.interposer_path);
    if let Some(max_cnt) = options.persistent_max_cnt {
        command.env(protocol::PERSISTENT_COUNT_ENV, max_cnt.to_string());
    }
    if std::env::var_os("LD_BIND_LAZY").is_none() {
        command.env("LD_BIND_NOW", "1");
    }
    set_if_absent(&mut command, "ASAN_OPTIONS", asan_options());
    set_if_absent(&mut command, "MSAN_OPTIONS", msan_options());
    command.envs(options.envs);

    let bind_pipes = {
        let child_reader_fd = child_reader.as_raw_fd();
        let child_writer_fd = child_writer.as_raw_fd();
        let rx_fd = rx.as_raw_fd();
        let tx_fd = tx.as_raw_fd();
        move || -> io::Result<()> {
            use nix::unistd::{close, dup2};
            dup2(child_reader_fd, protocol::fd::FUZZER_TO_FORKSRV).map_err(io::Error::from)?;
            dup2(child_writer_fd, protocol::fd::FORKSRV_TO_FUZZER).map_err(io::Error::from)?;
            for fd in [rx_fd, tx_fd, child_writer_fd, child_reader_fd] {
                close(fd).map_err(io::Error::from)?;
            }
            Ok(())
        }
    };
    // SAFETY: the closure only calls async-signal-safe functions (dup2/close)
    // between fork and exec, as required by `pre_exec`.
    unsafe { command.pre_exec(bind_pipes) };

    let memlimit_mb = options.memlimit_mb;
    let apply_limits = move || -> io::Result<()> {
        raise_nofile()?;
        if memlimit_mb > 0 {
            set_memory_limit(memlimit_mb << 20)?;
        }
        setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(io::Error::from)?;
        nix::unistd::setsid().map_err(io::Error::from)?;
        Ok(())
    };
    // SAFETY: `setrlimit`/`setsid` are async-signal-safe.
    unsafe { command.pre_exec(apply_limits) };

    debug!(target = %options.target.display(), "spawning fork server");
    let child = command.spawn().map_err(SpawnError::Exec)?;

    Ok(Spawned {
        child,
        rx,
        tx,
        stdin_file,
    })
}

fn dup_stdio(fd: RawFd) -> Result<Stdio, SpawnError> {
    use nix::unistd::dup;
    let dup_fd = dup(fd).map_err(|err| SpawnError::StdinTempFile(io::Error::from(err)))?;
    // SAFETY: `dup_fd` was just obtained from `dup` and is owned by us alone.
    Ok(unsafe { Stdio::from_raw_fd(dup_fd) })
}

fn raise_nofile() -> io::Result<()> {
    let (soft, hard) = nix::sys::resource::getrlimit(Resource::RLIMIT_NOFILE)?;
    if soft < MIN_NOFILE {
        let new_soft = MIN_NOFILE.min(hard);
        setrlimit(Resource::RLIMIT_NOFILE, new_soft, hard)?;
    }
    Ok(())
}

fn set_memory_limit(bytes: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    #[cfg(not(target_os = "linux"))]
    {
        setrlimit(Resource::RLIMIT_DATA, bytes, bytes)?;
    }
    Ok(())
}

fn set_if_absent(command: &mut Command, key: &str, value: impl AsRef<OsStr>) {
    if std::env::var_os(key).is_none() {
        command.env(key, value);
    }
}

fn asan_options() -> String {
    [
        "abort_on_error=1",
        "detect_leaks=0",
        "symbolize=0",
        "allocator_may_return_null=1",
    ]
    .join(":")
}

fn msan_options() -> String {
    [
        "exit_code=86",
        "symbolize=0",
        "msan_track_origins=0",
        "abort_on_error=1",
        "allocator_may_return_null=1",
    ]
    .join(":")
}

/// File that the driver keeps its current fuzz input written into when
/// [`InputSetup::Stdin`] is used.
pub fn stdin_path(file: &NamedTempFile) -> &Path {
    file.path()
}
