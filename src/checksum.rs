use crc::{Crc, CRC_64_ECMA_182};
#[cfg(test)] use mockall::automock;

/// The 64-bit wire checksum, computed over the complete frame image with the checksum field
///  zeroed. Interoperating with a given sender requires bit-exact agreement on the algorithm,
///  so it is an injection point rather than a fixed function: deployments plug in whatever the
///  wire spec mandates.
#[cfg_attr(test, automock)]
pub trait FrameChecksum: Send + Sync + 'static {
    fn checksum_of(&self, frame_image: &[u8]) -> u64;
}

const CRC_64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Default checksum backed by CRC-64/ECMA-182.
pub struct Crc64FrameChecksum;

impl FrameChecksum for Crc64FrameChecksum {
    fn checksum_of(&self, frame_image: &[u8]) -> u64 {
        CRC_64.checksum(frame_image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let checksum = Crc64FrameChecksum;
        assert_eq!(checksum.checksum_of(b"abcdef"), checksum.checksum_of(b"abcdef"));
    }

    #[test]
    fn test_sensitive_to_single_bit() {
        let checksum = Crc64FrameChecksum;
        let mut image = vec![0u8; 64];
        let reference = checksum.checksum_of(&image);
        image[17] ^= 0x01;
        assert_ne!(checksum.checksum_of(&image), reference);
    }
}
