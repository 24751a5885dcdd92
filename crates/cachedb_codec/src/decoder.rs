//! Strict decoder.
//!
//! Parsing is delegated to `ciborium`; this module then maps the generic tree
//! onto [`Value`], rejecting anything cachedb never writes (floats, foreign
//! tags, out-of-range integers), and finally re-encodes the result to confirm
//! the input was already in deterministic form. Accepting only canonical
//! bytes means a value has exactly one stored representation.

use crate::decimal::Decimal;
use crate::encoder::{to_canonical_cbor, DECIMAL_TAG};
use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use ciborium::value::Value as Raw;

/// Decodes one canonical CBOR value that spans all of `bytes`.
///
/// # Errors
///
/// - [`CodecError::UnexpectedEof`] if the input is truncated
/// - [`CodecError::Malformed`] if it is not CBOR at all
/// - [`CodecError::FloatForbidden`], [`CodecError::UnsupportedTag`],
///   [`CodecError::IntegerOverflow`] for values outside the data model
/// - [`CodecError::DuplicateKey`] for repeated map keys
/// - [`CodecError::NonCanonical`] for any other deviation from
///   deterministic encoding, including trailing bytes
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let raw: Raw = ciborium::de::from_reader(bytes).map_err(|e| match e {
        ciborium::de::Error::Io(_) => CodecError::UnexpectedEof,
        other => CodecError::Malformed {
            message: format!("{other:?}"),
        },
    })?;
    let value = convert(raw)?;
    if to_canonical_cbor(&value) != bytes {
        return Err(CodecError::NonCanonical);
    }
    Ok(value)
}

fn integer(raw: ciborium::value::Integer) -> CodecResult<i64> {
    i64::try_from(raw).map_err(|_| CodecError::IntegerOverflow)
}

fn convert(raw: Raw) -> CodecResult<Value> {
    Ok(match raw {
        Raw::Null => Value::Null,
        Raw::Bool(b) => Value::Bool(b),
        Raw::Integer(n) => Value::Integer(integer(n)?),
        Raw::Bytes(b) => Value::Bytes(b),
        Raw::Text(s) => Value::Text(s),
        Raw::Float(_) => return Err(CodecError::FloatForbidden),
        Raw::Array(items) => Value::Array(
            items
                .into_iter()
                .map(convert)
                .collect::<CodecResult<_>>()?,
        ),
        Raw::Map(pairs) => {
            let mut out = Vec::with_capacity(pairs.len());
            let mut previous: Option<Vec<u8>> = None;
            for (k, v) in pairs {
                let key = convert(k)?;
                let encoded = to_canonical_cbor(&key);
                if let Some(prev) = &previous {
                    match prev.cmp(&encoded) {
                        std::cmp::Ordering::Less => {}
                        std::cmp::Ordering::Equal => return Err(CodecError::DuplicateKey),
                        std::cmp::Ordering::Greater => return Err(CodecError::NonCanonical),
                    }
                }
                previous = Some(encoded);
                out.push((key, convert(v)?));
            }
            Value::Map(out)
        }
        Raw::Tag(DECIMAL_TAG, inner) => match *inner {
            Raw::Array(parts) => match <[Raw; 2]>::try_from(parts) {
                Ok([Raw::Integer(exp), Raw::Integer(mant)]) => {
                    let exponent = i32::try_from(integer(exp)?)
                        .map_err(|_| CodecError::invalid_decimal("exponent out of range"))?;
                    Value::Decimal(Decimal::new(integer(mant)?, exponent))
                }
                _ => return Err(CodecError::invalid_decimal("expected [exponent, mantissa]")),
            },
            _ => return Err(CodecError::invalid_decimal("expected array payload")),
        },
        Raw::Tag(tag, _) => return Err(CodecError::UnsupportedTag { tag }),
        _ => {
            return Err(CodecError::Malformed {
                message: "unsupported simple value".into(),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_encoder_writes() {
        let value = Value::record([
            ("name", Value::from("Winter jacket")),
            ("dims", Value::Array(vec![Value::Decimal(Decimal::new(305, -1))])),
            ("weight", Value::Null),
            ("qty", Value::Integer(-7)),
            ("blob", Value::Bytes(vec![0, 1, 2])),
            ("ok", Value::Bool(true)),
        ]);
        let bytes = to_canonical_cbor(&value);
        assert_eq!(from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn rejects_long_form_integer() {
        // 5 encoded with a one-byte argument
        assert_eq!(from_cbor(&[0x18, 0x05]), Err(CodecError::NonCanonical));
    }

    #[test]
    fn rejects_indefinite_length() {
        // [_ 1, 2]
        assert_eq!(
            from_cbor(&[0x9f, 0x01, 0x02, 0xff]),
            Err(CodecError::NonCanonical)
        );
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert_eq!(from_cbor(&[0x01, 0x02]), Err(CodecError::NonCanonical));
    }

    #[test]
    fn rejects_floats() {
        // 1.5 as half float
        assert_eq!(from_cbor(&[0xf9, 0x3e, 0x00]), Err(CodecError::FloatForbidden));
    }

    #[test]
    fn rejects_foreign_tags() {
        // tag 1 (epoch time) around 0
        assert_eq!(
            from_cbor(&[0xc1, 0x00]),
            Err(CodecError::UnsupportedTag { tag: 1 })
        );
    }

    #[test]
    fn rejects_unsorted_and_duplicate_keys() {
        // {"b": 1, "a": 2}
        let unsorted = [0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02];
        assert_eq!(from_cbor(&unsorted), Err(CodecError::NonCanonical));
        // {"a": 1, "a": 2}
        let duplicate = [0xa2, 0x61, b'a', 0x01, 0x61, b'a', 0x02];
        assert_eq!(from_cbor(&duplicate), Err(CodecError::DuplicateKey));
    }

    #[test]
    fn rejects_unnormalized_decimal() {
        // 4([-1, 150]) normalizes to 4([0, 15]), so the input is not canonical
        let bytes = [0xc4, 0x82, 0x20, 0x18, 0x96];
        assert_eq!(from_cbor(&bytes), Err(CodecError::NonCanonical));
    }

    #[test]
    fn truncated_input_is_eof() {
        assert_eq!(from_cbor(&[0x63, b'a']), Err(CodecError::UnexpectedEof));
        assert_eq!(from_cbor(&[]), Err(CodecError::UnexpectedEof));
    }
}
