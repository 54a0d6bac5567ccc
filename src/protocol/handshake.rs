use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Packet};

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create a new handshake packet for this server
    pub fn new(connection_id: u32) -> Self {
        let mut auth_data1 = [0u8; 8];
        let mut auth_data2 = vec![0u8; 12];

        // Generate random auth data
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut auth_data1);
        rng.fill_bytes(&mut auth_data2);

        Self {
            protocol_version: 10,
            server_version: "8.0.0-marlin".to_string(),
            connection_id,
            auth_plugin_data_part1: auth_data1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: 0x0002,
            auth_plugin_data_part2: auth_data2,
            auth_plugin_name: "mysql_native_password".to_string(),
        }
    }

    /// Get full auth plugin data (20 bytes)
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    /// Encode to packet
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        // Protocol version
        buf.put_u8(self.protocol_version);

        // Server version (null-terminated)
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        // Connection ID
        buf.put_u32_le(self.connection_id);

        // Auth plugin data part 1 (8 bytes)
        buf.extend_from_slice(&self.auth_plugin_data_part1);

        // Filler
        buf.put_u8(0);

        // Capability flags (lower 2 bytes)
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);

        // Character set
        buf.put_u8(self.character_set);

        // Status flags
        buf.put_u16_le(self.status_flags);

        // Capability flags (upper 2 bytes)
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        // Auth plugin data length
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8(
                (self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1) as u8,
            );
        } else {
            buf.put_u8(0);
        }

        // Reserved (10 bytes)
        buf.extend_from_slice(&[0u8; 10]);

        // Auth plugin data part 2
        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0); // Null terminator
        }

        // Auth plugin name
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        // Reserved (23 bytes)
        buf.advance(23);

        // Username (null-terminated)
        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        // Auth response
        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            // Length-encoded
            let len = buf.get_u8() as usize;
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = buf.get_u8() as usize;
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            // Null-terminated
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance(null_pos + 1);
            data
        };

        // Database
        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance(null_pos + 1);
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        // Auth plugin name
        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }
}

/// Compute the mysql_native_password scramble for a plaintext password.
/// The server uses this to verify the client's auth response.
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let hash1 = hasher.finalize();

    // SHA1(SHA1(password))
    let mut hasher = Sha1::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    // SHA1(auth_data + SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    // XOR SHA1(password) with SHA1(auth_data + SHA1(SHA1(password)))
    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: 0x0002, // SERVER_STATUS_AUTOCOMMIT
            warnings: 0,
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        // OK header
        buf.put_u8(0x00);

        // Affected rows (length-encoded int)
        super::results::put_lenenc_int(&mut buf, self.affected_rows);

        // Last insert id (length-encoded int)
        super::results::put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        // ERR header
        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Check if a client payload looks like an SSL upgrade request (32-byte
/// short handshake with CLIENT_SSL set).
pub fn is_ssl_request(payload: &Bytes) -> bool {
    payload.len() == 32 && {
        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        caps & CLIENT_SSL != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_handshake_encodes_version_and_id() {
        let hs = InitialHandshake::new(7);
        let pkt = hs.encode();
        assert_eq!(pkt.sequence_id, 0);
        assert_eq!(pkt.payload[0], 10); // protocol version
        assert!(pkt
            .payload
            .windows(hs.server_version.len())
            .any(|w| w == hs.server_version.as_bytes()));
        assert_eq!(hs.auth_plugin_data().len(), 20);
    }

    #[test]
    fn auth_response_empty_password() {
        assert!(compute_auth_response("", b"12345678901234567890").is_empty());
        assert_eq!(
            compute_auth_response("secret", b"12345678901234567890").len(),
            20
        );
    }

    #[test]
    fn err_packet_carries_sql_state() {
        let err = ErrPacket::new(1064, "42000", "syntax error");
        let pkt = err.encode(1, CLIENT_PROTOCOL_41);
        assert_eq!(pkt.payload[0], 0xFF);
        assert_eq!(u16::from_le_bytes([pkt.payload[1], pkt.payload[2]]), 1064);
        assert_eq!(pkt.payload[3], b'#');
        assert_eq!(&pkt.payload[4..9], b"42000");
    }
}
