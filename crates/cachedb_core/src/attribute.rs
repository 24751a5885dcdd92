//! Encoders for rich attribute values stored as opaque blobs.
//!
//! # Byte contract
//!
//! Every blob opens with a four-byte envelope:
//!
//! ```text
//! +------+------+---------+----------+
//! | 'C'  | 'A'  | version | type tag |
//! +------+------+---------+----------+
//! ```
//!
//! The type tag is checked against a closed allow-list ([`AttributeType`])
//! before any payload byte is looked at; the payload layout is then fixed by
//! the tag. Nothing in a blob can select code or types beyond that list.
//!
//! - Color (`0x01`): `r g b a` then a CRC-32 (big-endian) of the first 8
//!   bytes. Exactly 12 bytes.
//! - Image (`0x02`): format byte (`1` PNG, `2` JPEG, `3` HEIC), width and
//!   height as non-zero big-endian u32, data length as big-endian u32, the
//!   encoded image data (which must carry its format's signature), then a
//!   SHA-256 digest of every preceding byte. No trailing bytes.

use crate::checksum::crc32;
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: [u8; 2] = *b"CA";
const VERSION: u8 = 1;
const ENVELOPE_LEN: usize = 4;
const COLOR_LEN: usize = ENVELOPE_LEN + 4 + 4;
const IMAGE_HEADER_LEN: usize = ENVELOPE_LEN + 1 + 4 + 4 + 4;
const DIGEST_LEN: usize = 32;

/// Largest accepted image payload.
pub const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
const JPEG_SIGNATURE: &[u8] = &[0xff, 0xd8, 0xff];

/// Why a blob was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    /// Fewer bytes than the layout requires.
    #[error("blob truncated: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        actual: usize,
    },
    /// Envelope magic does not match.
    #[error("bad magic")]
    BadMagic,
    /// Unknown envelope version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    /// Type tag outside the allow-list.
    #[error("type tag {0:#04x} is not allowed")]
    ForbiddenType(u8),
    /// A valid tag, but not the one the field expects.
    #[error("expected {expected:?} blob, found {found:?}")]
    WrongType {
        /// The type the field stores.
        expected: AttributeType,
        /// The type in the blob.
        found: AttributeType,
    },
    /// Checksum or digest mismatch.
    #[error("integrity check failed")]
    Integrity,
    /// Structurally invalid payload.
    #[error("invalid payload: {0}")]
    Invalid(&'static str),
}

/// Allow-listed blob types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeType {
    /// [`Color`].
    Color = 0x01,
    /// [`Image`].
    Image = 0x02,
}

impl AttributeType {
    /// Looks a tag up in the allow-list.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Color),
            0x02 => Some(Self::Image),
            _ => None,
        }
    }
}

/// Reversible conversion between a rich value and its stored blob.
///
/// Implementations guarantee `decode(&encode(v)) == Ok(v)` for every value
/// they can be handed.
pub trait AttributeTransformer {
    /// The rich value.
    type Value;

    /// The envelope tag this transformer writes.
    const TYPE: AttributeType;

    /// Encodes `value`.
    fn encode(value: &Self::Value) -> Vec<u8>;

    /// Decodes a blob, rejecting anything malformed.
    ///
    /// # Errors
    ///
    /// Returns an [`AttributeError`] describing the first problem found.
    fn decode(bytes: &[u8]) -> Result<Self::Value, AttributeError>;
}

fn envelope(kind: AttributeType) -> Vec<u8> {
    vec![MAGIC[0], MAGIC[1], VERSION, kind as u8]
}

/// Validates the envelope and returns the payload.
fn open(bytes: &[u8], expected: AttributeType) -> Result<&[u8], AttributeError> {
    if bytes.len() < ENVELOPE_LEN {
        return Err(AttributeError::Truncated {
            needed: ENVELOPE_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[..2] != MAGIC {
        return Err(AttributeError::BadMagic);
    }
    if bytes[2] != VERSION {
        return Err(AttributeError::UnsupportedVersion(bytes[2]));
    }
    let found = AttributeType::from_tag(bytes[3]).ok_or(AttributeError::ForbiddenType(bytes[3]))?;
    if found != expected {
        return Err(AttributeError::WrongType { expected, found });
    }
    Ok(&bytes[ENVELOPE_LEN..])
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// An sRGB color with alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Color {
    /// Red channel.
    pub red: u8,
    /// Green channel.
    pub green: u8,
    /// Blue channel.
    pub blue: u8,
    /// Alpha channel, 255 is opaque.
    pub alpha: u8,
}

impl Color {
    /// An opaque color.
    #[must_use]
    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha: 0xff,
        }
    }
}

/// Transformer for [`Color`].
#[derive(Debug, Clone, Copy)]
pub struct ColorTransformer;

impl AttributeTransformer for ColorTransformer {
    type Value = Color;
    const TYPE: AttributeType = AttributeType::Color;

    fn encode(value: &Color) -> Vec<u8> {
        let mut out = envelope(Self::TYPE);
        out.extend_from_slice(&[value.red, value.green, value.blue, value.alpha]);
        let crc = crc32(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Color, AttributeError> {
        let payload = open(bytes, Self::TYPE)?;
        if bytes.len() != COLOR_LEN {
            return Err(if bytes.len() < COLOR_LEN {
                AttributeError::Truncated {
                    needed: COLOR_LEN,
                    actual: bytes.len(),
                }
            } else {
                AttributeError::Invalid("trailing bytes")
            });
        }
        if crc32(&bytes[..8]) != be_u32(bytes, 8) {
            return Err(AttributeError::Integrity);
        }
        Ok(Color {
            red: payload[0],
            green: payload[1],
            blue: payload[2],
            alpha: payload[3],
        })
    }
}

/// Encoded image formats accepted in blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG.
    Png,
    /// JPEG.
    Jpeg,
    /// HEIC.
    Heic,
}

impl ImageFormat {
    fn code(self) -> u8 {
        match self {
            Self::Png => 1,
            Self::Jpeg => 2,
            Self::Heic => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Png),
            2 => Some(Self::Jpeg),
            3 => Some(Self::Heic),
            _ => None,
        }
    }

    fn matches_signature(self, data: &[u8]) -> bool {
        match self {
            Self::Png => data.starts_with(PNG_SIGNATURE),
            Self::Jpeg => data.starts_with(JPEG_SIGNATURE),
            Self::Heic => data.get(4..8) == Some(b"ftyp".as_slice()),
        }
    }
}

/// An encoded image with its pixel dimensions.
///
/// Construction validates the same rules decoding enforces, so every
/// `Image` value encodes to a blob that decodes back to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    format: ImageFormat,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Image {
    /// Wraps encoded image data.
    ///
    /// # Errors
    ///
    /// Fails on zero dimensions, oversize data, or data lacking the
    /// format's signature.
    pub fn new(
        format: ImageFormat,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self, AttributeError> {
        if width == 0 || height == 0 {
            return Err(AttributeError::Invalid("zero dimension"));
        }
        if data.len() > MAX_IMAGE_BYTES {
            return Err(AttributeError::Invalid("image too large"));
        }
        if !format.matches_signature(&data) {
            return Err(AttributeError::Invalid("data does not match format signature"));
        }
        Ok(Self {
            format,
            width,
            height,
            data,
        })
    }

    /// Image format.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Encoded bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Transformer for [`Image`].
#[derive(Debug, Clone, Copy)]
pub struct ImageTransformer;

impl AttributeTransformer for ImageTransformer {
    type Value = Image;
    const TYPE: AttributeType = AttributeType::Image;

    fn encode(value: &Image) -> Vec<u8> {
        let mut out = envelope(Self::TYPE);
        out.push(value.format.code());
        out.extend_from_slice(&value.width.to_be_bytes());
        out.extend_from_slice(&value.height.to_be_bytes());
        // Image::new caps data at MAX_IMAGE_BYTES, well inside u32
        out.extend_from_slice(&(value.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&value.data);
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Image, AttributeError> {
        open(bytes, Self::TYPE)?;
        if bytes.len() < IMAGE_HEADER_LEN + DIGEST_LEN {
            return Err(AttributeError::Truncated {
                needed: IMAGE_HEADER_LEN + DIGEST_LEN,
                actual: bytes.len(),
            });
        }
        let format =
            ImageFormat::from_code(bytes[4]).ok_or(AttributeError::Invalid("unknown image format"))?;
        let width = be_u32(bytes, 5);
        let height = be_u32(bytes, 9);
        let len = be_u32(bytes, 13) as usize;
        if len > MAX_IMAGE_BYTES {
            return Err(AttributeError::Invalid("image too large"));
        }
        let body_end = IMAGE_HEADER_LEN + len;
        let expected = body_end + DIGEST_LEN;
        if bytes.len() < expected {
            return Err(AttributeError::Truncated {
                needed: expected,
                actual: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(AttributeError::Invalid("trailing bytes"));
        }
        if Sha256::digest(&bytes[..body_end]).as_slice() != &bytes[body_end..] {
            return Err(AttributeError::Integrity);
        }
        Image::new(format, width, height, bytes[IMAGE_HEADER_LEN..body_end].to_vec())
    }
}
