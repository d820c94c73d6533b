use crate::safe_converter::PrecheckedCast;
use crate::station_token::{FrameSetLabel, StationToken};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Wire frame type discriminator (u32 big-endian in the header).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum FrameType {
    ConnectionRequest = 1,
    ConnectionResponse = 2,
    OptionRequest = 3,
    OptionResponse = 4,
    Data = 5,
    AckNack = 6,
    Alert = 7,
    CommandRequest = 8,
    CommandResponse = 9,
    Cd1Encapsulation = 13,
}

/// The fixed 36-byte frame header.
///
/// `total_len` covers header plus payload; the trailer length is determined by the trailer's
///  own auth-size field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub total_len: u32,
    pub creator: StationToken,
    pub destination: StationToken,
    pub sequence: u64,
    pub series: u32,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 36;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.frame_type.into());
        buf.put_u32(self.total_len);
        self.creator.ser(buf);
        self.destination.ser(buf);
        buf.put_u64(self.sequence);
        buf.put_u32(self.series);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer too short for a frame header");
        }
        let raw_type = buf.get_u32();
        let frame_type = FrameType::try_from(raw_type)
            .map_err(|_| anyhow::anyhow!("unknown frame type {}", raw_type))?;
        let total_len = buf.get_u32();
        let creator = StationToken::deser(buf)?;
        let destination = StationToken::deser(buf)?;
        let sequence = buf.get_u64();
        let series = buf.get_u32();

        Ok(FrameHeader { frame_type, total_len, creator, destination, sequence, series })
    }

    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(Self::SERIALIZED_LEN)
    }
}

/// The frame trailer: auth payload (carried as opaque bytes, never interpreted here) and the
///  64-bit checksum, which is always the last eight bytes of the frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameTrailer {
    pub auth_id: u32,
    pub auth_body: Bytes,
    pub checksum: u64,
}

impl FrameTrailer {
    /// trailer length excluding the variable auth body
    pub const FIXED_LEN: usize = 16;

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN + self.auth_body.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.auth_id);
        buf.put_u32(self.auth_body.len().prechecked_cast());
        buf.put_slice(&self.auth_body);
        buf.put_u64(self.checksum);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameTrailer> {
        if buf.remaining() < Self::FIXED_LEN {
            bail!("buffer too short for a frame trailer");
        }
        let auth_id = buf.get_u32();
        let auth_size = buf.get_u32() as usize;
        if buf.remaining() < auth_size + 8 {
            bail!("buffer too short for auth body of {} bytes", auth_size);
        }
        let auth_body = buf.copy_to_bytes(auth_size);
        let checksum = buf.get_u64();

        Ok(FrameTrailer { auth_id, auth_body, checksum })
    }
}

/// One decoded wire frame.
///
/// `checksum_valid` is set by the decoder: a mismatch does not fail the decode, the frame is
///  returned flagged so the caller can alarm and discard it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
    pub trailer: FrameTrailer,
    pub checksum_valid: bool,
}

impl Frame {
    /// a frame ready for encoding, with `total_len` derived and the checksum left for the encoder
    pub fn new(
        frame_type: FrameType,
        creator: StationToken,
        destination: StationToken,
        sequence: u64,
        series: u32,
        payload: Bytes,
    ) -> Frame {
        Frame::with_auth(frame_type, creator, destination, sequence, series, payload, 0, Bytes::new())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_auth(
        frame_type: FrameType,
        creator: StationToken,
        destination: StationToken,
        sequence: u64,
        series: u32,
        payload: Bytes,
        auth_id: u32,
        auth_body: Bytes,
    ) -> Frame {
        let total_len = FrameHeader::SERIALIZED_LEN + payload.len();
        Frame {
            header: FrameHeader {
                frame_type,
                total_len: total_len.prechecked_cast(),
                creator,
                destination,
                sequence,
                series,
            },
            payload,
            trailer: FrameTrailer { auth_id, auth_body, checksum: 0 },
            checksum_valid: true,
        }
    }

    pub fn frame_set_label(&self) -> FrameSetLabel {
        FrameSetLabel::new(self.header.creator, self.header.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn token(name: &str) -> StationToken {
        StationToken::new(name).unwrap()
    }

    #[test]
    fn test_header_ser_explicit_bytes() {
        let header = FrameHeader {
            frame_type: FrameType::Data,
            total_len: 40,
            creator: token("STA1"),
            destination: token("IDC"),
            sequence: 7,
            series: 3,
        };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert_eq!(buf.as_ref(), &[
            0, 0, 0, 5, // type
            0, 0, 0, 40, // total length
            b'S', b'T', b'A', b'1', 0, 0, 0, 0, // creator
            b'I', b'D', b'C', 0, 0, 0, 0, 0, // destination
            0, 0, 0, 0, 0, 0, 0, 7, // sequence
            0, 0, 0, 3, // series
        ]);

        let mut b: &[u8] = &buf;
        let deser = FrameHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::type_zero(0)]
    #[case::type_gap(10)]
    #[case::type_out_of_range(99)]
    fn test_header_rejects_unknown_type(#[case] raw_type: u32) {
        let mut raw = vec![0u8; FrameHeader::SERIALIZED_LEN];
        raw[..4].copy_from_slice(&raw_type.to_be_bytes());
        assert!(FrameHeader::deser(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn test_trailer_round_trip() {
        let trailer = FrameTrailer {
            auth_id: 12,
            auth_body: Bytes::from_static(&[1, 2, 3, 4, 5]),
            checksum: 0xdead_beef_0102_0304,
        };

        let mut buf = BytesMut::new();
        trailer.ser(&mut buf);
        assert_eq!(buf.len(), trailer.serialized_len());

        let mut b: &[u8] = &buf;
        let deser = FrameTrailer::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, trailer);
    }

    #[test]
    fn test_trailer_rejects_truncated_auth() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(100); // declares more auth bytes than are present
        buf.put_slice(&[0u8; 20]);
        assert!(FrameTrailer::deser(&mut buf.as_ref()).is_err());
    }
}
