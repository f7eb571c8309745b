//! Codec registry: opaque decompression strategies used by exporters.
//!
//! Game archives almost never frame their compressed streams, so every codec
//! here is driven with the output size the directory declared.  The engine
//! never implements a codec itself; each variant delegates to a crate.
//!
//! Codecs that have a streaming decoder (zlib, raw deflate, zstd, brotli)
//! can be pulled incrementally through [`CodecId::stream_decoder`].  The
//! others are decoded in one shot by [`Codec::decompress`].

use std::io::{self, Read, Write};
use thiserror::Error;

// ── CodecId enum ─────────────────────────────────────────────────────────────

/// Runtime codec discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    None,
    Zlib,
    Deflate,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
}

impl CodecId {
    pub const ALL: [CodecId; 7] = [
        CodecId::None,
        CodecId::Zlib,
        CodecId::Deflate,
        CodecId::Zstd,
        CodecId::Lz4,
        CodecId::Brotli,
        CodecId::Lzma,
    ];

    /// Human-readable name (diagnostics and CLI).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None    => "none",
            CodecId::Zlib    => "zlib",
            CodecId::Deflate => "deflate",
            CodecId::Zstd    => "zstd",
            CodecId::Lz4     => "lz4",
            CodecId::Brotli  => "brotli",
            CodecId::Lzma    => "lzma",
        }
    }

    /// Wrap `reader` in an incremental decoder, when the codec has one.
    ///
    /// Returns `Ok(None)` for codecs that can only be decoded in one shot.
    pub fn stream_decoder<'a, R: Read + Send + 'a>(
        self,
        reader: R,
    ) -> Result<Option<Box<dyn Read + Send + 'a>>, CodecError> {
        Ok(match self {
            CodecId::None    => Some(Box::new(reader)),
            CodecId::Zlib    => Some(Box::new(flate2::read::ZlibDecoder::new(reader))),
            CodecId::Deflate => Some(Box::new(flate2::read::DeflateDecoder::new(reader))),
            CodecId::Zstd    => Some(Box::new(
                zstd::stream::read::Decoder::new(reader)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?,
            )),
            CodecId::Brotli  => Some(Box::new(brotli::Decompressor::new(reader, 4096))),
            CodecId::Lz4 | CodecId::Lzma => None,
        })
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Decompressed size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    /// Decode `data`, which the directory says expands to `expected_len` bytes.
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct ZlibCodec;
impl Codec for ZlibCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zlib }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let mut w = flate2::write::ZlibEncoder::new(Vec::new(), flate_level(level));
        w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        w.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        flate2::read::ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct DeflateCodec;
impl Codec for DeflateCodec {
    fn codec_id(&self) -> CodecId { CodecId::Deflate }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let mut w = flate2::write::DeflateEncoder::new(Vec::new(), flate_level(level));
        w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        w.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        flate2::read::DeflateDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

/// Raw LZ4 block (no frame, no size prefix); the size comes from the directory.
pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::block::compress(data))
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        lz4_flex::block::decompress(data, expected_len)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        lzma_rs::lzma_decompress(&mut io::BufReader::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

fn flate_level(level: i32) -> flate2::Compression {
    flate2::Compression::new(level.clamp(0, 9) as u32)
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a CodecId to a built-in codec.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None    => Box::new(NoneCodec),
        CodecId::Zlib    => Box::new(ZlibCodec),
        CodecId::Deflate => Box::new(DeflateCodec),
        CodecId::Zstd    => Box::new(ZstdCodec),
        CodecId::Lz4     => Box::new(Lz4Codec),
        CodecId::Brotli  => Box::new(BrotliCodec),
        CodecId::Lzma    => Box::new(LzmaCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"texture texture texture mesh mesh mesh ".repeat(64)
    }

    #[test]
    fn every_codec_decodes_its_own_output() {
        let data = sample();
        for id in CodecId::ALL {
            let codec = get_codec(id);
            let packed = codec.compress(&data, 6).unwrap();
            let unpacked = codec.decompress(&packed, data.len()).unwrap();
            assert_eq!(unpacked, data, "codec {}", id.name());
        }
    }

    #[test]
    fn streaming_decoder_matches_one_shot() {
        let data = sample();
        for id in [CodecId::Zlib, CodecId::Deflate, CodecId::Zstd, CodecId::Brotli] {
            let packed = get_codec(id).compress(&data, 6).unwrap();
            let mut out = Vec::new();
            id.stream_decoder(&packed[..]).unwrap().unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, data, "codec {}", id.name());
        }
        assert!(CodecId::Lz4.stream_decoder(&b""[..]).unwrap().is_none());
    }

    #[test]
    fn corrupt_zlib_is_an_error() {
        assert!(ZlibCodec.decompress(b"\x78\x9cnot-deflate", 10).is_err());
    }
}
