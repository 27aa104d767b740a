use std::io;

/// Failures that can occur while spawning the initial target process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to create the status pipe")]
    StatusPipe(#[source] io::Error),

    #[error("Failed to create the control pipe")]
    ControlPipe(#[source] io::Error),

    #[error("Failed to create the stdin temp file")]
    StdinTempFile(#[source] io::Error),

    #[error("The target could not be executed: {0}")]
    Exec(#[source] io::Error),
}

/// Why the driver gave up waiting for the server's hello.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Timeout while initializing fork server")]
    Timeout,

    #[error(
        "Fork server crashed during initialization; this looks like an out-of-memory condition \
         under the current memory limit ({memlimit_mb} MiB) combined with a sanitizer"
    )]
    CrashSuspectedMemoryLimitAndSanitizer { memlimit_mb: u64 },

    #[error(
        "Fork server crashed during initialization; no memory limit is set, so this is \
         unlikely to be an out-of-memory condition"
    )]
    CrashNoMemoryLimit,

    #[error(
        "Fork server crashed during initialization; the memory limit ({memlimit_mb} MiB) may be \
         too low for the target to initialize"
    )]
    CrashMemoryLimitTooLow { memlimit_mb: u64 },

    #[error("Fork server exited cleanly before sending its hello message")]
    SilentExit,

    #[error("I/O error while waiting for the fork server hello")]
    Io(#[from] io::Error),
}

/// Failures in the steady-state command/response protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Short read on the status pipe: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("Short write on the control pipe: expected {expected} bytes, wrote {got}")]
    ShortWrite { expected: usize, got: usize },

    #[error("Fork server returned an invalid child pid: {0}")]
    InvalidPid(i32),

    #[error("Expected a RUN acknowledgement of 0, got {0}")]
    UnexpectedRunAck(u32),

    #[error("Status is not ready yet")]
    NotReady,

    #[error("I/O error talking to the fork server")]
    Io(#[from] io::Error),
}

/// Top-level error returned by the public driver API.
#[derive(Debug, thiserror::Error)]
pub enum ForkserverError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error")]
    Io(#[from] io::Error),
}
