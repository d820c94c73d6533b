use thiserror::Error;
#[cfg(test)] use mockall::automock;

/// samples are carried as-is, in the fixed-width format named by the subframe's format tag
pub const TRANSFORM_NONE: u8 = 0;
/// externally-compressed, compression applied before the auth signature
pub const TRANSFORM_COMPRESSED_BEFORE_AUTH: u8 = 1;
/// externally-compressed, compression applied after the auth signature
pub const TRANSFORM_COMPRESSED_AFTER_AUTH: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error("unsupported sample transform {0}")]
    UnsupportedTransform(u8),

    #[error("unknown sample format tag {0:?}")]
    UnknownFormat(String),

    #[error("sample block of {actual} bytes does not hold {expected} samples of {width} bytes")]
    LengthMismatch { expected: usize, width: usize, actual: usize },

    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Decompression of transform 1/2 sample blocks is delegated to an external codec; this crate
///  only dispatches on the transform kind.
#[cfg_attr(test, automock)]
pub trait SampleDecompressor: Send + Sync + 'static {
    fn decompress(&self, transform: u8, data: &[u8], expected_samples: usize) -> Result<Vec<i32>, SampleError>;
}

/// For deployments without a compression codec: every compressed subframe fails recoverably.
pub struct NoDecompression;

impl SampleDecompressor for NoDecompression {
    fn decompress(&self, transform: u8, _data: &[u8], _expected_samples: usize) -> Result<Vec<i32>, SampleError> {
        Err(SampleError::UnsupportedTransform(transform))
    }
}

/// Decode one subframe's sample block into samples, dispatching on the transform kind.
pub fn decode_samples(
    transform: u8,
    format_tag: &[u8; 2],
    data: &[u8],
    expected_samples: usize,
    decompressor: &dyn SampleDecompressor,
) -> Result<Vec<i32>, SampleError> {
    match transform {
        TRANSFORM_NONE => decode_raw_samples(format_tag, data, expected_samples),
        TRANSFORM_COMPRESSED_BEFORE_AUTH | TRANSFORM_COMPRESSED_AFTER_AUTH => {
            decompressor.decompress(transform, data, expected_samples)
        }
        other => Err(SampleError::UnsupportedTransform(other)),
    }
}

/// Raw fixed-width big-endian signed samples: 2, 3 or 4 bytes per sample.
fn decode_raw_samples(format_tag: &[u8; 2], data: &[u8], expected_samples: usize) -> Result<Vec<i32>, SampleError> {
    let width = match format_tag {
        b"s2" | b"i2" => 2,
        b"s3" => 3,
        b"s4" | b"i4" => 4,
        other => return Err(SampleError::UnknownFormat(String::from_utf8_lossy(other.as_slice()).into_owned())),
    };

    if data.len() != expected_samples * width {
        return Err(SampleError::LengthMismatch { expected: expected_samples, width, actual: data.len() });
    }

    let samples = data.chunks_exact(width)
        .map(|chunk| match width {
            2 => i16::from_be_bytes([chunk[0], chunk[1]]) as i32,
            3 => {
                // sign-extend the 24-bit value
                let sign = if chunk[0] & 0x80 != 0 { 0xff } else { 0x00 };
                i32::from_be_bytes([sign, chunk[0], chunk[1], chunk[2]])
            }
            _ => i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        })
        .collect();
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::s2(*b"s2", vec![0x00, 0x01, 0xff, 0xff, 0x80, 0x00], vec![1, -1, -32768])]
    #[case::i2(*b"i2", vec![0x12, 0x34, 0x00, 0x00], vec![0x1234, 0])]
    #[case::s3(*b"s3", vec![0x00, 0x00, 0x05, 0xff, 0xff, 0xfb, 0x80, 0x00, 0x00], vec![5, -5, -8_388_608])]
    #[case::s4(*b"s4", vec![0x00, 0x01, 0x02, 0x03, 0xff, 0xff, 0xff, 0xff], vec![0x00010203, -1])]
    #[case::i4(*b"i4", vec![0x7f, 0xff, 0xff, 0xff], vec![i32::MAX])]
    fn test_decode_raw(#[case] tag: [u8; 2], #[case] data: Vec<u8>, #[case] expected: Vec<i32>) {
        let samples = decode_samples(TRANSFORM_NONE, &tag, &data, expected.len(), &NoDecompression).unwrap();
        assert_eq!(samples, expected);
    }

    #[test]
    fn test_length_mismatch() {
        let result = decode_samples(TRANSFORM_NONE, b"s2", &[0, 1, 2], 2, &NoDecompression);
        assert_eq!(result, Err(SampleError::LengthMismatch { expected: 2, width: 2, actual: 3 }));
    }

    #[test]
    fn test_unknown_format_tag() {
        let result = decode_samples(TRANSFORM_NONE, b"x9", &[], 0, &NoDecompression);
        assert!(matches!(result, Err(SampleError::UnknownFormat(_))));
    }

    #[rstest]
    #[case(3)]
    #[case(200)]
    fn test_unimplemented_transform(#[case] transform: u8) {
        let result = decode_samples(transform, b"s2", &[], 0, &NoDecompression);
        assert_eq!(result, Err(SampleError::UnsupportedTransform(transform)));
    }

    #[test]
    fn test_compressed_transform_is_delegated() {
        let mut decompressor = MockSampleDecompressor::new();
        decompressor.expect_decompress()
            .withf(|transform, data, expected| *transform == TRANSFORM_COMPRESSED_BEFORE_AUTH && data == [9, 9] && *expected == 4)
            .returning(|_, _, _| Ok(vec![1, 2, 3, 4]));

        let samples = decode_samples(TRANSFORM_COMPRESSED_BEFORE_AUTH, b"s4", &[9, 9], 4, &decompressor).unwrap();
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_no_decompression_fails_recoverably() {
        let result = decode_samples(TRANSFORM_COMPRESSED_AFTER_AUTH, b"s2", &[1, 2, 3], 6, &NoDecompression);
        assert_eq!(result, Err(SampleError::UnsupportedTransform(TRANSFORM_COMPRESSED_AFTER_AUTH)));
    }
}
