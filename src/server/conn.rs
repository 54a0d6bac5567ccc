//! Connection handle shared between the wire loop and the query handler.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

/// Status flags returned to the client on every response.
/// See <https://dev.mysql.com/doc/dev/mysql-server/latest/mysql__com_8h.html>.
pub mod status_flags {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// Transport backing a connection. The liveness poller only works for TCP,
/// where it needs the raw descriptor and the local port.
#[derive(Debug, Clone, Copy)]
pub enum Transport {
    Tcp { raw_fd: i32, local_port: u16 },
    Other,
}

/// A live client connection. Cheap metadata plus the mutable status-flag
/// bitfield; the stream itself stays with the wire loop.
pub struct Conn {
    id: u32,
    user: String,
    peer_host: String,
    transport: Transport,
    status: AtomicU16,
    disable_client_multi_statements: AtomicBool,
}

impl Conn {
    pub fn new(
        id: u32,
        user: impl Into<String>,
        peer_host: impl Into<String>,
        transport: Transport,
    ) -> Self {
        Self {
            id,
            user: user.into(),
            peer_host: peer_host.into(),
            transport,
            status: AtomicU16::new(status_flags::SERVER_STATUS_AUTOCOMMIT),
            disable_client_multi_statements: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn peer_host(&self) -> &str {
        &self.peer_host
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn status(&self) -> u16 {
        self.status.load(Ordering::Relaxed)
    }

    pub fn set_status_flag(&self, flag: u16) {
        self.status.fetch_or(flag, Ordering::Relaxed);
    }

    pub fn clear_status_flag(&self, flag: u16) {
        self.status.fetch_and(!flag, Ordering::Relaxed);
    }

    pub fn set_disable_client_multi_statements(&self, disable: bool) {
        self.disable_client_multi_statements
            .store(disable, Ordering::Relaxed);
    }

    pub fn client_multi_statements_disabled(&self) -> bool {
        self.disable_client_multi_statements.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_flags_set_and_clear() {
        let conn = Conn::new(1, "u", "h", Transport::Other);
        assert_eq!(conn.status(), status_flags::SERVER_STATUS_AUTOCOMMIT);

        conn.set_status_flag(status_flags::SERVER_STATUS_IN_TRANS);
        assert_ne!(conn.status() & status_flags::SERVER_STATUS_IN_TRANS, 0);

        conn.clear_status_flag(status_flags::SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(conn.status() & status_flags::SERVER_STATUS_AUTOCOMMIT, 0);
        assert_ne!(conn.status() & status_flags::SERVER_STATUS_IN_TRANS, 0);
    }
}
