use bytes::{Buf, BufMut, Bytes, BytesMut};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Passthrough codec: the proxy never deserializes the messages it relays,
/// it only needs to move opaque frames between two gRPC connections. Message
/// bytes are copied verbatim; only the codec name (`"proxy>proto"`) is
/// negotiated so that both legs agree the payload is raw, not protobuf.
#[derive(Debug, Clone, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if !src.has_remaining() {
            return Ok(None);
        }
        let mut buf = BytesMut::with_capacity(src.remaining());
        buf.put(src);
        Ok(Some(buf.freeze()))
    }
}

/// The codec name negotiated over `grpc-encoding` / content-subtype —
/// mirrors the Go `rawCodec.Name()`: `"proxy>" + parent.Name()`.
pub const CODEC_NAME: &str = "proxy>proto";
