//! OS-level socket state inspection, used to notice peers that vanished
//! without a protocol-level goodbye.
//!
//! Only Linux exposes the needed information (`/proc/net/tcp`); every other
//! platform reports [`SockStateError::Unsupported`] and callers fall back to
//! read timeouts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SockStateError {
    #[error("socket checks not implemented on this platform")]
    Unsupported,

    #[error("error checking socket state: {0}")]
    Check(String),
}

/// Observed state of a connection's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    Established,
    /// The peer has closed or the socket no longer exists.
    Broken,
}

// TCP states from include/net/tcp_states.h.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const TCP_ESTABLISHED: u8 = 0x01;

/// Inode backing a connected socket file descriptor.
#[cfg(target_os = "linux")]
pub fn socket_inode(fd: i32) -> Result<u64, SockStateError> {
    let link = std::fs::read_link(format!("/proc/self/fd/{fd}"))
        .map_err(|e| SockStateError::Check(e.to_string()))?;
    let target = link.to_string_lossy();
    target
        .strip_prefix("socket:[")
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inode| inode.parse().ok())
        .ok_or_else(|| SockStateError::Check(format!("fd {fd} is not a socket: {target}")))
}

#[cfg(not(target_os = "linux"))]
pub fn socket_inode(_fd: i32) -> Result<u64, SockStateError> {
    Err(SockStateError::Unsupported)
}

/// Look up the state of the socket bound to `local_port` with the given
/// inode. A socket that has disappeared from the kernel table is reported
/// as [`SockState::Broken`].
#[cfg(target_os = "linux")]
pub fn inode_sock_state(local_port: u16, inode: u64) -> Result<SockState, SockStateError> {
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let content = match std::fs::read_to_string(table) {
            Ok(c) => c,
            Err(_) => continue,
        };
        for entry in parse_proc_net_tcp(&content) {
            if entry.local_port == local_port && entry.inode == inode {
                return Ok(if entry.state == TCP_ESTABLISHED {
                    SockState::Established
                } else {
                    SockState::Broken
                });
            }
        }
    }
    // Not in either table any more: the kernel has torn it down.
    Ok(SockState::Broken)
}

#[cfg(not(target_os = "linux"))]
pub fn inode_sock_state(_local_port: u16, _inode: u64) -> Result<SockState, SockStateError> {
    Err(SockStateError::Unsupported)
}

#[derive(Debug, PartialEq, Eq)]
struct SockTabEntry {
    local_port: u16,
    state: u8,
    inode: u64,
}

/// Parse the body of `/proc/net/tcp`. Unparseable lines are skipped.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_net_tcp(content: &str) -> Vec<SockTabEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let local_port = fields[1]
                .rsplit(':')
                .next()
                .and_then(|p| u16::from_str_radix(p, 16).ok())?;
            let state = u8::from_str_radix(fields[3], 16).ok()?;
            let inode = fields[9].parse().ok()?;
            Some(SockTabEntry {
                local_port,
                state,
                inode,
            })
        })
        .collect()
}
