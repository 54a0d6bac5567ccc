use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::Packet;

/// MySQL packet codec for use with tokio Framed
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Encoder that can encode raw bytes directly
impl Encoder<&[u8]> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        let pkt = Packet::new(3, Bytes::from_static(b"\x03SELECT 1"));
        codec.encode(pkt, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.sequence_id, 3);
        assert_eq!(&decoded.payload[..], b"\x03SELECT 1");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_packet_waits_for_more_data() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00, 0x01, b'a'][..]);
        // Header promises 5 payload bytes but only one arrived.
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
