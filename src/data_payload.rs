use crate::control_messages::padding_to_4;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire_time::{format_wire_time, parse_wire_time, WIRE_TIME_LEN};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;
use tracing::{trace, warn};

/// Channel suffixes this receiver recognizes (vertical / north / east components and their
///  numeric equivalents). An unrecognized suffix is a data-quality signal, not a parse failure:
///  the subframe still decodes and travels upstream flagged.
const RECOGNIZED_CHANNEL_SUFFIXES: [char; 9] = ['Z', 'N', 'E', '1', '2', '3', 'z', 'n', 'e'];

fn channel_suffix_recognized(station_code: &str) -> bool {
    station_code.chars().last()
        .map(|c| RECOGNIZED_CHANNEL_SUFFIXES.contains(&c))
        .unwrap_or(false)
}

/// One channel's sample record inside a DATA frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Subframe {
    /// site + channel + location, 10 bytes on the wire
    pub station_code: String,
    pub transform: u8,
    pub sensor: u8,
    /// uncompressed sample format tag ("s2", "s3", "s4", "i2", "i4")
    pub sample_format: [u8; 2],
    pub calib_factor: f32,
    pub calib_period: f32,
    /// None if the wire timestamp was malformed; the subframe still decodes
    pub timestamp: Option<NaiveDateTime>,
    pub duration_ms: u32,
    pub sample_count: u32,
    /// clock / quality status bytes, passed through uninterpreted
    pub status: Bytes,
    /// compressed or raw sample bytes, decoded separately via `sample_codec`
    pub sample_data: Bytes,
    pub subframe_count: u32,
    pub auth_key_id: u32,
    pub auth_body: Bytes,
    /// false if the station code's channel suffix is not in the recognized whitelist
    pub channel_recognized: bool,
}

impl Subframe {
    const STATION_CODE_LEN: usize = 10;
    /// fixed fields between the length prefix and the status block
    const FIXED_HEAD_LEN: usize = Self::STATION_CODE_LEN + 1 + 1 + 2 + 4 + 4 + WIRE_TIME_LEN + 4 + 4;

    fn body_len(&self) -> usize {
        Self::FIXED_HEAD_LEN
            + 4 + self.status.len() + padding_to_4(self.status.len())
            + 4 + self.sample_data.len() + padding_to_4(self.sample_data.len())
            + 4 + 4
            + 4 + self.auth_body.len() + padding_to_4(self.auth_body.len())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.body_len().prechecked_cast());

        let mut code = [0u8; Self::STATION_CODE_LEN];
        let code_bytes = self.station_code.as_bytes();
        let code_len = code_bytes.len().min(Self::STATION_CODE_LEN);
        code[..code_len].copy_from_slice(&code_bytes[..code_len]);
        buf.put_slice(&code);

        buf.put_u8(self.transform);
        buf.put_u8(self.sensor);
        buf.put_slice(&self.sample_format);
        buf.put_f32(self.calib_factor);
        buf.put_f32(self.calib_period);
        match self.timestamp {
            Some(time) => buf.put_slice(&format_wire_time(time)),
            None => buf.put_bytes(0, WIRE_TIME_LEN),
        }
        buf.put_u32(self.duration_ms);
        buf.put_u32(self.sample_count);

        buf.put_u32(self.status.len().prechecked_cast());
        buf.put_slice(&self.status);
        buf.put_bytes(0, padding_to_4(self.status.len()));

        buf.put_u32(self.sample_data.len().prechecked_cast());
        buf.put_slice(&self.sample_data);
        buf.put_bytes(0, padding_to_4(self.sample_data.len()));

        buf.put_u32(self.subframe_count);
        buf.put_u32(self.auth_key_id);
        buf.put_u32(self.auth_body.len().prechecked_cast());
        buf.put_slice(&self.auth_body);
        buf.put_bytes(0, padding_to_4(self.auth_body.len()));
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Subframe> {
        if buf.remaining() < 4 {
            bail!("buffer too short for a subframe length prefix");
        }
        let body_len = buf.get_u32().safe_cast();
        if buf.remaining() < body_len {
            bail!("subframe declares {} bytes but only {} remain", body_len, buf.remaining());
        }
        let mut body = buf.copy_to_bytes(body_len);
        Self::deser_body(&mut body)
    }

    fn deser_body(body: &mut impl Buf) -> anyhow::Result<Subframe> {
        if body.remaining() < Self::FIXED_HEAD_LEN {
            bail!("subframe body too short for the fixed header");
        }

        let mut code = [0u8; Self::STATION_CODE_LEN];
        body.copy_to_slice(&mut code);
        let end = code.iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map(|p| p + 1)
            .unwrap_or(0);
        let station_code = String::from_utf8_lossy(&code[..end]).into_owned();

        let transform = body.get_u8();
        let sensor = body.get_u8();
        let mut sample_format = [0u8; 2];
        body.copy_to_slice(&mut sample_format);
        let calib_factor = body.get_f32();
        let calib_period = body.get_f32();

        let mut time_raw = [0u8; WIRE_TIME_LEN];
        body.copy_to_slice(&mut time_raw);
        let timestamp = match parse_wire_time(&time_raw) {
            Ok(time) => Some(time),
            Err(e) => {
                warn!("subframe for {:?} carries a malformed timestamp ({}) - decoding without it", station_code, e);
                None
            }
        };

        let duration_ms = body.get_u32();
        let sample_count = body.get_u32();

        let status = read_padded_block(body, "status")?;
        let sample_data = read_padded_block(body, "sample data")?;

        if body.remaining() < 8 {
            bail!("subframe body too short for the trailing counters");
        }
        let subframe_count = body.get_u32();
        let auth_key_id = body.get_u32();
        let auth_body = read_padded_block(body, "auth")?;

        if body.has_remaining() {
            trace!("ignoring {} trailing bytes in subframe for {:?}", body.remaining(), station_code);
        }

        let channel_recognized = channel_suffix_recognized(&station_code);
        if !channel_recognized {
            warn!("station code {:?} has an unrecognized channel suffix", station_code);
        }

        Ok(Subframe {
            station_code,
            transform,
            sensor,
            sample_format,
            calib_factor,
            calib_period,
            timestamp,
            duration_ms,
            sample_count,
            status,
            sample_data,
            subframe_count,
            auth_key_id,
            auth_body,
            channel_recognized,
        })
    }
}

/// a size-prefixed block padded to 4-byte alignment
fn read_padded_block(buf: &mut impl Buf, what: &'static str) -> anyhow::Result<Bytes> {
    if buf.remaining() < 4 {
        bail!("buffer too short for the {} block size", what);
    }
    let size = buf.get_u32().safe_cast();
    let padded = size + padding_to_4(size);
    if buf.remaining() < padded {
        bail!("{} block declares {} bytes but only {} remain", what, padded, buf.remaining());
    }
    let block = buf.copy_to_bytes(size);
    buf.advance(padded - size);
    Ok(block)
}

/// The decoded payload of a DATA frame: the data-frame sub-header plus the per-channel subframes.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPayload {
    pub duration_ms: u32,
    pub nominal_time: Option<NaiveDateTime>,
    pub channel_names: Vec<String>,
    pub subframes: Vec<Subframe>,
}

impl DataPayload {
    /// assembles a payload whose channel-name table is derived from the subframes
    pub fn new(duration_ms: u32, nominal_time: Option<NaiveDateTime>, subframes: Vec<Subframe>) -> DataPayload {
        let channel_names = subframes.iter().map(|sf| sf.station_code.clone()).collect();
        DataPayload { duration_ms, nominal_time, channel_names, subframes }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.subframes.len().prechecked_cast());
        buf.put_u32(self.duration_ms);
        match self.nominal_time {
            Some(time) => buf.put_slice(&format_wire_time(time)),
            None => buf.put_bytes(0, WIRE_TIME_LEN),
        }

        let table_len = self.channel_names.len() * Subframe::STATION_CODE_LEN;
        buf.put_u32(table_len.prechecked_cast());
        for name in &self.channel_names {
            let mut entry = [0u8; Subframe::STATION_CODE_LEN];
            let name_bytes = name.as_bytes();
            let len = name_bytes.len().min(Subframe::STATION_CODE_LEN);
            entry[..len].copy_from_slice(&name_bytes[..len]);
            buf.put_slice(&entry);
        }
        buf.put_bytes(0, padding_to_4(table_len));

        for subframe in &self.subframes {
            subframe.ser(buf);
        }
    }

    /// Decodes the payload. A structurally broken subframe is skipped via its length prefix so
    ///  the remaining channels of the frame still get through.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataPayload> {
        if buf.remaining() < 32 {
            bail!("buffer too short for a data payload header");
        }
        let nchan = buf.get_u32().safe_cast();
        let duration_ms = buf.get_u32();

        let mut time_raw = [0u8; WIRE_TIME_LEN];
        buf.copy_to_slice(&mut time_raw);
        let nominal_time = match parse_wire_time(&time_raw) {
            Ok(time) => Some(time),
            Err(e) => {
                warn!("data payload carries a malformed nominal time ({}) - decoding without it", e);
                None
            }
        };

        let table_len = buf.get_u32().safe_cast();
        let table_padded = table_len + padding_to_4(table_len);
        if buf.remaining() < table_padded {
            bail!("channel table declares {} bytes but only {} remain", table_padded, buf.remaining());
        }
        if table_len < nchan * Subframe::STATION_CODE_LEN {
            bail!("channel table of {} bytes is too short for {} channels", table_len, nchan);
        }
        let table = buf.copy_to_bytes(table_len);
        buf.advance(table_padded - table_len);

        let mut channel_names = Vec::with_capacity(nchan);
        for entry in table.chunks(Subframe::STATION_CODE_LEN).take(nchan) {
            let end = entry.iter()
                .rposition(|&b| b != 0 && b != b' ')
                .map(|p| p + 1)
                .unwrap_or(0);
            channel_names.push(String::from_utf8_lossy(&entry[..end]).into_owned());
        }

        let mut subframes = Vec::with_capacity(nchan);
        for index in 0..nchan {
            if buf.remaining() < 4 {
                bail!("payload ends after {} of {} subframes", index, nchan);
            }
            let body_len = buf.get_u32().safe_cast();
            if buf.remaining() < body_len {
                bail!("subframe {} declares {} bytes but only {} remain", index, body_len, buf.remaining());
            }
            let mut body = buf.copy_to_bytes(body_len);
            match Subframe::deser_body(&mut body) {
                Ok(subframe) => subframes.push(subframe),
                Err(e) => warn!("skipping malformed subframe {} of {}: {}", index, nchan, e),
            }
        }

        Ok(DataPayload { duration_ms, nominal_time, channel_names, subframes })
    }
}
