pub mod codec;
pub mod command;
pub mod handshake;
pub mod packet;
pub mod results;

pub use codec::PacketCodec;
pub use command::ClientCommand;
pub use handshake::{
    compute_auth_response, is_ssl_request, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{capabilities, Packet};
pub use results::{
    column_count_packet, column_definition_packet, row_packet, stmt_prepare_ok_packet, EofPacket,
};
