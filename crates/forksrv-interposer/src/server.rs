//! The in-target command loop (C2) and child gate (C3).
//!
//! Ported from the `forkserver_init` loop in the original C source
//! (`instrumentation/forkserver.c`), kept deliberately close to raw `libc`
//! calls: this code runs inside the target process before `main`, so it must
//! not assume anything about the target's own runtime beyond what the C
//! startup itself guarantees, and it must never panic (no unwinding machinery
//! can be assumed to be in a usable state here).

use std::os::raw::c_void;

use forksrv::protocol::{self, Command};

/// Runs the server loop. Returns normally only for a gated/released child
/// that should resume executing user code; every other path through this
/// function either loops forever or calls `_exit` directly.
///
/// # Safety
/// Must be called at most once per process, before any other thread exists,
/// and with fds [`protocol::fd::FUZZER_TO_FORKSRV`] /
/// [`protocol::fd::FORKSRV_TO_FUZZER`] either both valid pipe ends or both
/// absent.
pub(crate) unsafe fn forkserver_init() {
    let hello = protocol::HELLO;
    let written = unsafe {
        libc::write(
            protocol::fd::FORKSRV_TO_FUZZER,
            hello.as_ptr().cast::<c_void>(),
            hello.len(),
        )
    };
    if written != hello.len() as isize {
        // Not running under a forkserver-aware driver: let the target run normally.
        return;
    }

    let mut gate_pipe = [0_i32; 2];
    if unsafe { libc::pipe(gate_pipe.as_mut_ptr()) } != 0 {
        unsafe { libc::_exit(1) };
    }

    let mut child_pid: libc::pid_t = -1;

    loop {
        let mut command_byte: u8 = 0;
        let n = unsafe {
            libc::read(
                protocol::fd::FUZZER_TO_FORKSRV,
                (&raw mut command_byte).cast::<c_void>(),
                1,
            )
        };
        if n != 1 {
            unsafe { libc::_exit(1) };
        }

        let Some(command) = Command::from_byte(command_byte) else {
            unsafe { libc::_exit(1) };
        };

        let response: i32 = match command {
            Command::Exit => unsafe { libc::_exit(0) },

            Command::Fork | Command::ForkRun => {
                let pid = unsafe { libc::fork() };
                if pid < 0 {
                    unsafe { libc::_exit(1) };
                }
                if pid == 0 {
                    child_resume(gate_pipe, command);
                    // `child_resume` only returns when this process should
                    // resume running user code.
                    return;
                }
                child_pid = pid;
                pid
            }

            Command::Run => {
                let go = protocol::GATE_GO;
                let n = unsafe {
                    libc::write(gate_pipe[1], go.as_ptr().cast::<c_void>(), go.len())
                };
                if n != go.len() as isize {
                    unsafe { libc::_exit(1) };
                }
                0
            }

            Command::GetStatus => {
                let mut status: libc::c_int = 0;
                let ret = unsafe { libc::waitpid(child_pid, &raw mut status, 0) };
                if ret < 0 {
                    unsafe { libc::_exit(1) };
                }
                status
            }
        };

        let response_bytes = response.to_ne_bytes();
        let n = unsafe {
            libc::write(
                protocol::fd::FORKSRV_TO_FUZZER,
                response_bytes.as_ptr().cast::<c_void>(),
                response_bytes.len(),
            )
        };
        if n != response_bytes.len() as isize {
            unsafe { libc::_exit(1) };
        }
    }
}

/// Child side of `FORK`/`FORK_RUN`: close the fds the child has no business
/// holding, then either gate on `gate_pipe[0]` (`FORK`) or proceed
/// immediately (`FORK_RUN`).
fn child_resume(gate_pipe: [i32; 2], command: Command) {
    unsafe {
        libc::close(protocol::fd::FUZZER_TO_FORKSRV);
        libc::close(protocol::fd::FORKSRV_TO_FUZZER);
        libc::close(gate_pipe[1]);
    }

    if command == Command::Fork {
        let mut buf = [0_u8; 4];
        let n = unsafe { libc::read(gate_pipe[0], buf.as_mut_ptr().cast::<c_void>(), 4) };
        if n != 4 || buf != protocol::GATE_GO {
            unsafe { libc::_exit(1) };
        }
    }

    unsafe { libc::close(gate_pipe[0]) };
}
