//! Wire format shared by the driver (this crate) and the in-target server
//! (the `forksrv-interposer` crate).
//!
//! Everything here is a plain constant or a tiny enum: both sides must agree
//! on these values without negotiating them, so there is no room for either
//! side to infer them independently.

/// File descriptor numbers reserved for the server's ends of the control and
/// status pipes inside the target process. Must stay outside 0/1/2.
pub mod fd {
    /// Control pipe: driver writes commands, server reads them.
    pub const FUZZER_TO_FORKSRV: i32 = 198;
    /// Status pipe: server writes responses, driver reads them.
    pub const FORKSRV_TO_FUZZER: i32 = FUZZER_TO_FORKSRV + 1;
}

/// The fixed 32-bit hello the server writes on `server_to_fuzzer` immediately
/// after it starts, before entering the command loop.
pub const HELLO: [u8; 4] = 0x41414141_u32.to_ne_bytes();

/// Payload written on the gate pipe to release a gated child.
pub const GATE_GO: [u8; 4] = 0_u32.to_ne_bytes();

/// Command bytes sent by the driver on the control pipe. One byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Exit = b'X',
    Fork = b'F',
    ForkRun = b'R',
    Run = b'G',
    GetStatus = b'S',
}

impl Command {
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'X' => Some(Self::Exit),
            b'F' => Some(Self::Fork),
            b'R' => Some(Self::ForkRun),
            b'G' => Some(Self::Run),
            b'S' => Some(Self::GetStatus),
            _ => None,
        }
    }
}

/// Well-known environment variable used to pass the preload path to the
/// target on platforms using the ELF/glibc dynamic linker.
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Environment variable that, when set to a decimal iteration count, asks the
/// target to run in persistent mode. Surfaced only as a contract; the
/// persistent-mode loop itself lives outside this crate's scope.
pub const PERSISTENT_COUNT_ENV: &str = "FORKSRV_PERSISTENT_MAX_CNT";
