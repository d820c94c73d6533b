use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::{Debug, Display, Formatter};

/// An 8-byte station / network identity token as it appears in frame headers. Shorter names are
///  padded with NUL bytes on the wire; trailing NULs and spaces are not significant.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct StationToken([u8; 8]);

impl StationToken {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn new(name: &str) -> anyhow::Result<StationToken> {
        if name.is_empty() || name.len() > Self::SERIALIZED_LEN {
            bail!("station token {:?} must be 1..=8 bytes", name);
        }
        if !name.bytes().all(|b| b.is_ascii_graphic()) {
            bail!("station token {:?} must be printable ascii", name);
        }
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        Ok(StationToken(raw))
    }

    pub fn from_raw(raw: [u8; 8]) -> StationToken {
        StationToken(raw)
    }

    pub fn to_raw(&self) -> [u8; 8] {
        self.0
    }

    /// the token with wire padding stripped
    pub fn trimmed(&self) -> String {
        let end = self.0.iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map(|p| p + 1)
            .unwrap_or(0);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<StationToken> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer too short for a station token");
        }
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut raw);
        Ok(StationToken(raw))
    }
}

impl Display for StationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.trimmed())
    }
}

impl Debug for StationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StationToken({:?})", self.trimmed())
    }
}

/// The 20-byte `CREATOR:DEST` label naming a frame set in ACKNACK payloads.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FrameSetLabel {
    pub creator: StationToken,
    pub destination: StationToken,
}

impl FrameSetLabel {
    pub const SERIALIZED_LEN: usize = 20;

    pub fn new(creator: StationToken, destination: StationToken) -> FrameSetLabel {
        FrameSetLabel { creator, destination }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let text = format!("{}:{}", self.creator.trimmed(), self.destination.trimmed());
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        raw[..text.len()].copy_from_slice(text.as_bytes());
        buf.put_slice(&raw);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameSetLabel> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer too short for a frame set label");
        }
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut raw);

        let end = raw.iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map(|p| p + 1)
            .unwrap_or(0);
        let text = std::str::from_utf8(&raw[..end])
            .map_err(|_| anyhow::anyhow!("frame set label is not ascii: {:?}", raw))?;
        let Some((creator, destination)) = text.split_once(':') else {
            bail!("frame set label {:?} has no ':' separator", text);
        };
        Ok(FrameSetLabel {
            creator: StationToken::new(creator)?,
            destination: StationToken::new(destination)?,
        })
    }
}

impl Display for FrameSetLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.creator, self.destination)
    }
}

impl Debug for FrameSetLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameSetLabel({self})")
    }
}
