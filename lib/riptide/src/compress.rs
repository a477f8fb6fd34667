use crate::support::{ErrorType, NetworkError, NetworkResult};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Per-datagram compression seam. The pipeline tries `compress` on every outgoing
/// datagram and keeps the plain form whenever the encoded form is not strictly smaller,
/// so implementations never need to guarantee a gain.
///
/// Implementations carry internal scratch and must be constructed once per host.
pub trait Compressor {
    /// Encodes `input` into `output`. Returns true only when the whole input was encoded
    /// and the result is strictly smaller than the input; on false the caller emits the
    /// plain form and `output` contents are meaningless.
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> bool;

    /// Decodes `input` into `output`, refusing to expand beyond `max_out` bytes.
    fn decompress(&mut self, input: &[u8], max_out: usize, output: &mut Vec<u8>) -> NetworkResult<()>;
}

/// Raw-DEFLATE compressor. The wire stays self-describing through the header flag, so
/// the algorithm choice is local to the host pair configuration.
pub struct DeflateCompressor {
    deflate: Compress,
    inflate: Decompress,
}

impl DeflateCompressor {
    pub fn new() -> DeflateCompressor {
        DeflateCompressor {
            deflate: Compress::new(Compression::default(), false),
            inflate: Decompress::new(false),
        }
    }
}

impl Compressor for DeflateCompressor {
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> bool {
        if input.is_empty() {
            return false;
        }

        self.deflate.reset();
        output.clear();
        // Capacity one short of the input: a stream that needs the full input size
        // cannot be smaller, so running out of room already answers the question.
        output.reserve(input.len() - 1);

        match self.deflate.compress_vec(input, output, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => output.len() < input.len(),
            _ => false,
        }
    }

    fn decompress(&mut self, input: &[u8], max_out: usize, output: &mut Vec<u8>) -> NetworkResult<()> {
        self.inflate.reset(false);
        output.clear();
        output.reserve(max_out);

        let status = self
            .inflate
            .decompress_vec(input, output, FlushDecompress::Finish)
            .map_err(|_| NetworkError::Fatal(ErrorType::Decompression))?;

        match status {
            // `reserve` may round the capacity up, so a clean end can still overshoot
            // the bound and must be rechecked.
            Status::StreamEnd if output.len() <= max_out => Ok(()),
            Status::StreamEnd => Err(NetworkError::Fatal(ErrorType::DecompressionOverflow)),
            // Anything short of a clean end with `max_out` capacity available means the
            // stream wanted to expand past the bound or was truncated.
            _ if output.len() >= max_out => Err(NetworkError::Fatal(ErrorType::DecompressionOverflow)),
            _ => Err(NetworkError::Fatal(ErrorType::Decompression)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_compressible() {
        let mut compressor = DeflateCompressor::new();
        let input: Vec<u8> = std::iter::repeat(b"hello world ".iter().copied())
            .take(64)
            .flatten()
            .collect();

        let mut encoded = Vec::new();
        assert!(compressor.compress(&input, &mut encoded));
        assert!(encoded.len() < input.len());

        let mut decoded = Vec::new();
        compressor
            .decompress(&encoded, input.len() * 2, &mut decoded)
            .unwrap();

        assert_eq!(decoded, input);
    }

    #[test]
    fn test_incompressible_input_reports_false() {
        let mut compressor = DeflateCompressor::new();

        // High-entropy input cannot shrink.
        let input: Vec<u8> = (0..256u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();

        let mut encoded = Vec::new();
        assert!(!compressor.compress(&input, &mut encoded));
    }

    #[test]
    fn test_empty_input_reports_false() {
        let mut compressor = DeflateCompressor::new();
        let mut encoded = Vec::new();

        assert!(!compressor.compress(&[], &mut encoded));
    }

    #[test]
    fn test_decompression_bound_enforced() {
        let mut compressor = DeflateCompressor::new();
        let input = vec![7u8; 4096];

        let mut encoded = Vec::new();
        assert!(compressor.compress(&input, &mut encoded));

        let mut decoded = Vec::new();
        assert_eq!(
            compressor
                .decompress(&encoded, 512, &mut decoded)
                .unwrap_err(),
            NetworkError::Fatal(ErrorType::DecompressionOverflow)
        );
    }

    #[test]
    fn test_corrupt_stream_rejected() {
        let mut compressor = DeflateCompressor::new();

        let mut decoded = Vec::new();
        let result = compressor.decompress(&[0xde, 0xad, 0xbe, 0xef], 1024, &mut decoded);

        assert!(result.is_err());
    }

    #[test]
    fn test_reuse_across_datagrams() {
        let mut compressor = DeflateCompressor::new();

        for round in 0..4 {
            let input = vec![round as u8; 512];

            let mut encoded = Vec::new();
            assert!(compressor.compress(&input, &mut encoded));

            let mut decoded = Vec::new();
            compressor.decompress(&encoded, 1024, &mut decoded).unwrap();
            assert_eq!(decoded, input);
        }
    }
}
