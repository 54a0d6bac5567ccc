use bytes::{Buf, Bytes};

use super::packet::Command;

/// Parsed command from client
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    StmtPrepare(String),
    /// Raw `COM_STMT_EXECUTE` payload (after the command byte); decoding
    /// needs the prepared statement's parameter count.
    StmtExecute(Bytes),
    StmtClose(u32),
    ResetConnection,
    FieldList { table: String, wildcard: String },
    Unknown(u8, Bytes),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        if payload.is_empty() {
            return ClientCommand::Unknown(0, Bytes::new());
        }

        let cmd = Command::from(payload[0]);
        let data = payload.slice(1..);

        match cmd {
            Command::Query => {
                let sql = String::from_utf8_lossy(&data).to_string();
                ClientCommand::Query(sql)
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(&data).to_string();
                ClientCommand::InitDb(db)
            }
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::StmtPrepare => {
                let sql = String::from_utf8_lossy(&data).to_string();
                ClientCommand::StmtPrepare(sql)
            }
            Command::StmtExecute => ClientCommand::StmtExecute(data),
            Command::StmtClose => {
                if data.len() >= 4 {
                    let mut buf = data.clone();
                    ClientCommand::StmtClose(buf.get_u32_le())
                } else {
                    ClientCommand::Unknown(payload[0], data)
                }
            }
            Command::ResetConnection => ClientCommand::ResetConnection,
            Command::FieldList => {
                // Table name is null-terminated, followed by optional wildcard
                let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let table = String::from_utf8_lossy(&data[..null_pos]).to_string();
                let wildcard = if null_pos + 1 < data.len() {
                    String::from_utf8_lossy(&data[null_pos + 1..]).to_string()
                } else {
                    String::new()
                };
                ClientCommand::FieldList { table, wildcard }
            }
            _ => ClientCommand::Unknown(payload[0], data),
        }
    }
}
