// Compression: gzip for file payloads (`props.cmpr = "gzip"`)

use super::CryptoError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Value advertised in `props.cmpr` for gzip payloads
pub const GZIP: &str = "gzip";

#[cfg_attr(test, mockall::automock)]
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor;

impl GzipCompressor {
    pub fn new() -> Self {
        Self
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| CryptoError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CryptoError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| CryptoError::Compression(e.to_string()))?;
        Ok(decompressed)
    }
}
