use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

/// Serializes a value to bytes ([`Serializer`]), optionally compresses those
/// bytes ([`Compressor`]), then encodes the result to a wire string
/// ([`Encoder`]). Mirrors the body-construction pipeline a Celery task
/// envelope goes through before being published.
pub struct Packer {
    serializer: Box<dyn Serializer>,
    compressor: Box<dyn Compressor>,
    encoder: Box<dyn Encoder>,
    compression_header: Option<&'static str>,
    body_encoding: &'static str,
}

/// The outcome of [`Packer::pack`], carrying every wire-visible label
/// alongside the packed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packed {
    /// The packed, wire-ready body.
    pub body: String,
    /// `"application/json"` or `"application/x-yaml"`.
    pub content_type: &'static str,
    /// `"base64"` when any non-identity compression was applied, `"utf-8"`
    /// otherwise.
    pub body_encoding: &'static str,
    /// The `headers.compression` MIME token, present only when compression
    /// is not identity. Per the Celery wire-compatibility quirk, gzip
    /// compression is actually performed with zlib, but the header still
    /// reads `application/x-gzip`.
    pub compression_header: Option<&'static str>,
}

/// Failure while packing a task body.
#[derive(Debug, Error)]
pub enum PackError {
    /// The value could not be serialized.
    #[error("failed to serialize task body: {0}")]
    Serialize(String),
}

/// The compression algorithm requested for a task's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    /// No compression; body stays plaintext.
    Identity,
    /// zlib (RFC 1950) compression.
    Zlib,
    /// Requested as gzip, but actually compressed with zlib; see
    /// [`Packed::compression_header`].
    Gzip,
}

impl Packer {
    /// Builds a packer for the given serializer and requested compression,
    /// using the default encoder pairing (plaintext for identity
    /// compression, base64 otherwise).
    pub fn new(serializer: Box<dyn Serializer>, compression: CompressionKind) -> Self {
        Self::with_encoder(serializer, compression, None)
    }

    /// Same as [`new`](Self::new), but lets the caller override the encoder.
    pub fn with_encoder(
        serializer: Box<dyn Serializer>,
        compression: CompressionKind,
        encoder_override: Option<Box<dyn Encoder>>,
    ) -> Self {
        let compressor: Box<dyn Compressor> = match compression {
            CompressionKind::Identity => Box::new(IdentityCompressor),
            CompressionKind::Zlib | CompressionKind::Gzip => Box::new(ZlibCompressor),
        };

        let is_identity = matches!(compression, CompressionKind::Identity);

        let encoder = encoder_override.unwrap_or_else(|| {
            if is_identity {
                Box::new(PlainEncoder) as Box<dyn Encoder>
            } else {
                Box::new(Base64Encoder) as Box<dyn Encoder>
            }
        });

        let compression_header = match compression {
            // Deliberate quirk: both zlib and gzip report as x-gzip.
            CompressionKind::Identity => None,
            CompressionKind::Zlib | CompressionKind::Gzip => Some("application/x-gzip"),
        };

        let body_encoding = if is_identity { "utf-8" } else { "base64" };

        Self { serializer, compressor, encoder, compression_header, body_encoding }
    }

    /// Runs `value` through serialize → compress → encode, returning the
    /// packed body along with the wire labels it implies.
    pub fn pack(&self, value: &serde_json::Value) -> Result<Packed, PackError> {
        let serialized = self.serializer.serialize(value)?;
        let compressed = self.compressor.compress(&serialized);
        let body = self.encoder.encode(&compressed);

        Ok(Packed {
            body,
            content_type: self.serializer.content_type(),
            body_encoding: self.body_encoding,
            compression_header: self.compression_header,
        })
    }
}

/// Serializes a JSON-able value to bytes.
pub trait Serializer: Send + Sync {
    /// Serializes `value` to bytes.
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, PackError>;
    /// The MIME content type this serializer produces.
    fn content_type(&self) -> &'static str;
}

/// Compresses (or passes through) a byte buffer.
pub trait Compressor: Send + Sync {
    /// Compresses `bytes`.
    fn compress(&self, bytes: &[u8]) -> Vec<u8>;
}

/// Encodes compressed (or raw) bytes into a wire-safe string.
pub trait Encoder: Send + Sync {
    /// Encodes `bytes` to a string.
    fn encode(&self, bytes: &[u8]) -> String;
}

/// The default JSON serializer (`application/json`).
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, PackError> {
        serde_json::to_vec(value).map_err(|error| PackError::Serialize(error.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// The YAML serializer (`application/x-yaml`).
pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, PackError> {
        serde_yml::to_string(value)
            .map(|s| s.into_bytes())
            .map_err(|error| PackError::Serialize(error.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/x-yaml"
    }
}

struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn compress(&self, bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }
}

struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&self, bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).expect("in-memory zlib encode is infallible");
        encoder.finish().expect("in-memory zlib finish is infallible")
    }
}

/// Inverse of the zlib compressor, exposed for tests and for consumers that
/// need to decode a published envelope's body.
pub fn zlib_decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

struct PlainEncoder;

impl Encoder for PlainEncoder {
    fn encode(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

struct Base64Encoder;

impl Encoder for Base64Encoder {
    fn encode(&self, bytes: &[u8]) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn identity_compression_is_plaintext_utf8() {
        // Given
        let packer = Packer::new(Box::new(JsonSerializer), CompressionKind::Identity);

        // When
        let packed = packer.pack(&json!(["a", {}, {}])).unwrap();

        // Then
        assert_eq!(packed.body, r#"["a",{},{}]"#);
        assert_eq!(packed.body_encoding, "utf-8");
        assert_eq!(packed.compression_header, None);
        assert_eq!(packed.content_type, "application/json");
    }

    #[test]
    fn gzip_request_is_actually_zlib_but_labeled_x_gzip() {
        // Given
        let packer = Packer::new(Box::new(JsonSerializer), CompressionKind::Gzip);

        // When
        let packed = packer.pack(&json!([[], {}, {}])).unwrap();

        // Then: label says gzip...
        assert_eq!(packed.compression_header, Some("application/x-gzip"));
        assert_eq!(packed.body_encoding, "base64");

        // ...but the bytes are actually zlib-compressed.
        use base64::Engine;
        let compressed = base64::engine::general_purpose::STANDARD.decode(&packed.body).unwrap();
        let decompressed = zlib_decompress(&compressed).unwrap();
        assert_eq!(decompressed, br#"[[],{},{}]"#);
    }
}
