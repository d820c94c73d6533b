use crate::checksum::FrameChecksum;
use crate::frame::{Frame, FrameHeader, FrameTrailer};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

#[derive(Debug, Error)]
pub enum FrameReadError {
    /// Type or length fields outside sane bounds. Once this happens the stream's framing can no
    ///  longer be trusted, so callers close the connection rather than attempt to resync.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("connection i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Decodes frames from a byte stream and encodes frames for sending.
///
/// The codec owns a reusable read buffer that grows on demand, so decoded `Frame` values own
///  copies of their payload bytes and stay valid across subsequent reads.
pub struct FrameCodec {
    checksum: Arc<dyn FrameChecksum>,
    max_frame_len: u32,
    max_auth_len: u32,
    read_buf: BytesMut,
}

impl FrameCodec {
    pub fn new(checksum: Arc<dyn FrameChecksum>, max_frame_len: u32, max_auth_len: u32) -> FrameCodec {
        FrameCodec {
            checksum,
            max_frame_len,
            max_auth_len,
            read_buf: BytesMut::with_capacity(2048),
        }
    }

    /// Reads one complete frame: fixed header, payload, trailer. The checksum is verified over
    ///  the full frame image with the checksum field zeroed; a mismatch yields a frame flagged
    ///  `checksum_valid == false` rather than an error, leaving disposal to the caller.
    pub async fn read_frame<R: AsyncRead + Unpin>(&mut self, stream: &mut R) -> Result<Frame, FrameReadError> {
        let mut header_buf = [0u8; FrameHeader::SERIALIZED_LEN];
        stream.read_exact(&mut header_buf).await?;

        let header = FrameHeader::deser(&mut &header_buf[..])
            .map_err(|e| FrameReadError::MalformedHeader(e.to_string()))?;
        if header.total_len < FrameHeader::SERIALIZED_LEN as u32 || header.total_len > self.max_frame_len {
            return Err(FrameReadError::MalformedHeader(
                format!("total length {} outside [{}, {}]", header.total_len, FrameHeader::SERIALIZED_LEN, self.max_frame_len)));
        }
        let total_len: usize = header.total_len.safe_cast();

        // payload plus the fixed auth-id / auth-size prefix of the trailer
        self.read_buf.clear();
        self.read_buf.extend_from_slice(&header_buf);
        self.read_buf.resize(total_len + 8, 0);
        stream.read_exact(&mut self.read_buf[FrameHeader::SERIALIZED_LEN..]).await?;

        let auth_size = u32::from_be_bytes(
            self.read_buf[total_len + 4..total_len + 8].try_into().expect("slice length is fixed"));
        if auth_size > self.max_auth_len {
            return Err(FrameReadError::MalformedHeader(
                format!("implausible auth size {} (maximum {})", auth_size, self.max_auth_len)));
        }
        let auth_size: usize = auth_size.safe_cast();

        let full_len = total_len + FrameTrailer::FIXED_LEN + auth_size;
        self.read_buf.resize(full_len, 0);
        stream.read_exact(&mut self.read_buf[total_len + 8..]).await?;

        let transmitted = u64::from_be_bytes(
            self.read_buf[full_len - 8..].try_into().expect("slice length is fixed"));
        self.read_buf[full_len - 8..].fill(0);
        let computed = self.checksum.checksum_of(&self.read_buf);
        let checksum_valid = computed == transmitted;
        if !checksum_valid {
            trace!("frame #{} checksum mismatch: transmitted {:#x}, computed {:#x}", header.sequence, transmitted, computed);
        }

        let auth_id = u32::from_be_bytes(
            self.read_buf[total_len..total_len + 4].try_into().expect("slice length is fixed"));

        Ok(Frame {
            header,
            payload: Bytes::copy_from_slice(&self.read_buf[FrameHeader::SERIALIZED_LEN..total_len]),
            trailer: FrameTrailer {
                auth_id,
                auth_body: Bytes::copy_from_slice(&self.read_buf[total_len + 8..total_len + 8 + auth_size]),
                checksum: transmitted,
            },
            checksum_valid,
        })
    }

    /// Lays out header, payload and trailer; the checksum is computed last over the image with
    ///  a zeroed checksum field and then patched in.
    pub fn encode(&self, frame: &Frame) -> BytesMut {
        let mut header = frame.header;
        header.total_len = (FrameHeader::SERIALIZED_LEN + frame.payload.len()).prechecked_cast();

        let encoded_len: usize = header.total_len.safe_cast();
        let mut buf = BytesMut::with_capacity(encoded_len + frame.trailer.serialized_len());
        header.ser(&mut buf);
        buf.put_slice(&frame.payload);
        buf.put_u32(frame.trailer.auth_id);
        buf.put_u32(frame.trailer.auth_body.len().prechecked_cast());
        buf.put_slice(&frame.trailer.auth_body);
        buf.put_u64(0);

        let checksum = self.checksum.checksum_of(&buf);
        let len = buf.len();
        buf[len - 8..].copy_from_slice(&checksum.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Crc64FrameChecksum;
    use crate::frame::FrameType;
    use crate::station_token::StationToken;
    use rstest::rstest;
    use tokio::runtime::Builder;

    fn codec() -> FrameCodec {
        FrameCodec::new(Arc::new(Crc64FrameChecksum), 1024 * 1024, 256)
    }

    fn sample_frame(payload: &'static [u8]) -> Frame {
        Frame::with_auth(
            FrameType::Data,
            StationToken::new("STA1").unwrap(),
            StationToken::new("IDC").unwrap(),
            42,
            3,
            Bytes::from_static(payload),
            7,
            Bytes::from_static(&[9, 9, 9]),
        )
    }

    #[test]
    fn test_round_trip() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut codec = codec();
            let frame = sample_frame(&[1, 2, 3, 4, 5, 6]);

            let buf = codec.encode(&frame);
            let decoded = codec.read_frame(&mut buf.as_ref()).await.unwrap();

            assert!(decoded.checksum_valid);
            assert_eq!(decoded.header, frame.header);
            assert_eq!(decoded.payload, frame.payload);
            assert_eq!(decoded.trailer.auth_id, frame.trailer.auth_id);
            assert_eq!(decoded.trailer.auth_body, frame.trailer.auth_body);
        });
    }

    #[test]
    fn test_corrupted_byte_flags_frame_invalid() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut codec = codec();
            let mut buf = codec.encode(&sample_frame(&[1, 2, 3, 4, 5, 6]));
            buf[40] ^= 0xff;

            let decoded = codec.read_frame(&mut buf.as_ref()).await.unwrap();
            assert!(!decoded.checksum_valid);
        });
    }

    #[rstest]
    #[case::unknown_type({
        let mut raw = vec![0u8; 60];
        raw[..4].copy_from_slice(&77u32.to_be_bytes());
        raw[4..8].copy_from_slice(&40u32.to_be_bytes());
        raw
    })]
    #[case::total_len_below_header({
        let mut raw = vec![0u8; 60];
        raw[..4].copy_from_slice(&5u32.to_be_bytes());
        raw[4..8].copy_from_slice(&10u32.to_be_bytes());
        raw
    })]
    #[case::total_len_above_maximum({
        let mut raw = vec![0u8; 60];
        raw[..4].copy_from_slice(&5u32.to_be_bytes());
        raw[4..8].copy_from_slice(&(100 * 1024 * 1024u32).to_be_bytes());
        raw
    })]
    fn test_malformed_header(#[case] raw: Vec<u8>) {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut codec = codec();
            let result = codec.read_frame(&mut raw.as_slice()).await;
            assert!(matches!(result, Err(FrameReadError::MalformedHeader(_))));
        });
    }

    #[test]
    fn test_implausible_auth_size() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut codec = codec();
            let mut buf = codec.encode(&sample_frame(&[1, 2]));
            // patch the auth size field (directly after the payload) to an implausible value
            let auth_size_offset = FrameHeader::SERIALIZED_LEN + 2 + 4;
            buf[auth_size_offset..auth_size_offset + 4].copy_from_slice(&10_000u32.to_be_bytes());

            let result = codec.read_frame(&mut buf.as_ref()).await;
            assert!(matches!(result, Err(FrameReadError::MalformedHeader(_))));
        });
    }

    #[test]
    fn test_read_buffer_grows_beyond_initial_capacity() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut codec = codec();
            let payload: &'static [u8] = Box::leak(vec![0xabu8; 64 * 1024].into_boxed_slice());
            let frame = sample_frame(payload);

            let buf = codec.encode(&frame);
            let decoded = codec.read_frame(&mut buf.as_ref()).await.unwrap();
            assert!(decoded.checksum_valid);
            assert_eq!(decoded.payload.len(), 64 * 1024);
        });
    }

    #[test]
    fn test_truncated_stream_is_an_io_error() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut codec = codec();
            let buf = codec.encode(&sample_frame(&[1, 2, 3]));

            let result = codec.read_frame(&mut &buf[..buf.len() - 4]).await;
            assert!(matches!(result, Err(FrameReadError::Io(_))));
        });
    }
}
