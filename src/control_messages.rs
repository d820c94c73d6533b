use crate::gap_list::Gap;
use crate::safe_converter::PrecheckedCast;
use crate::station_token::{FrameSetLabel, StationToken};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

/// ACKNACK payload: the receiver's (or sender's) current view of one frame set, i.e. which
///  sequence intervals are still missing inside the `[lowest_seq, highest_seq]` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckNackMessage {
    pub frame_set: FrameSetLabel,
    pub lowest_seq: u64,
    pub highest_seq: u64,
    pub gaps: Vec<Gap>,
}

impl AckNackMessage {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.frame_set.ser(buf);
        buf.put_u64(self.lowest_seq);
        buf.put_u64(self.highest_seq);
        buf.put_u32(self.gaps.len().prechecked_cast());
        for gap in &self.gaps {
            buf.put_u64(gap.low);
            buf.put_u64(gap.high);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckNackMessage> {
        let frame_set = FrameSetLabel::deser(buf)?;
        if buf.remaining() < 20 {
            bail!("buffer too short for an ACKNACK envelope");
        }
        let lowest_seq = buf.get_u64();
        let highest_seq = buf.get_u64();
        let gap_count = buf.get_u32() as usize;
        if buf.remaining() < gap_count * 16 {
            bail!("ACKNACK declares {} gaps but the payload is too short", gap_count);
        }
        let mut gaps = Vec::with_capacity(gap_count);
        for _ in 0..gap_count {
            let low = buf.get_u64();
            let high = buf.get_u64();
            gaps.push(Gap { low, high });
        }
        Ok(AckNackMessage { frame_set, lowest_seq, highest_seq, gaps })
    }
}

pub const SERVICE_TCP: [u8; 4] = *b"TCP\0";

/// Connection request / response payload exchanged during the reopen handshake. Unused address
///  fields are zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMessage {
    pub major_version: u16,
    pub minor_version: u16,
    pub station: StationToken,
    pub service: [u8; 4],
    pub ip: Ipv4Addr,
    pub port: u16,
    pub second_ip: Ipv4Addr,
    pub second_port: u16,
}

impl ConnectionMessage {
    pub const SERIALIZED_LEN: usize = 28;

    pub fn for_station(station: StationToken) -> ConnectionMessage {
        ConnectionMessage {
            major_version: 1,
            minor_version: 0,
            station,
            service: SERVICE_TCP,
            ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
            second_ip: Ipv4Addr::UNSPECIFIED,
            second_port: 0,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.major_version);
        buf.put_u16(self.minor_version);
        self.station.ser(buf);
        buf.put_slice(&self.service);
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.port);
        buf.put_slice(&self.second_ip.octets());
        buf.put_u16(self.second_port);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionMessage> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer too short for a connection message");
        }
        let major_version = buf.get_u16();
        let minor_version = buf.get_u16();
        let station = StationToken::deser(buf)?;
        let mut service = [0u8; 4];
        buf.copy_to_slice(&mut service);
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        let ip = Ipv4Addr::from(octets);
        let port = buf.get_u16();
        buf.copy_to_slice(&mut octets);
        let second_ip = Ipv4Addr::from(octets);
        let second_port = buf.get_u16();

        Ok(ConnectionMessage {
            major_version,
            minor_version,
            station,
            service,
            ip,
            port,
            second_ip,
            second_port,
        })
    }
}

/// ALERT payload: a short human-readable reason, padded to 4 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub message: String,
}

impl AlertMessage {
    pub fn terminated() -> AlertMessage {
        AlertMessage { message: "terminated".to_string() }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.message.len().prechecked_cast());
        buf.put_slice(self.message.as_bytes());
        buf.put_bytes(0, padding_to_4(self.message.len()));
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AlertMessage> {
        if buf.remaining() < 4 {
            bail!("buffer too short for an alert message");
        }
        let size = buf.get_u32() as usize;
        if buf.remaining() < size {
            bail!("alert declares {} bytes but the payload is too short", size);
        }
        let mut raw = vec![0u8; size];
        buf.copy_to_slice(&mut raw);
        let padding = padding_to_4(size).min(buf.remaining());
        buf.advance(padding);

        Ok(AlertMessage { message: String::from_utf8_lossy(&raw).into_owned() })
    }
}

pub fn padding_to_4(len: usize) -> usize {
    (4 - len % 4) % 4
}
