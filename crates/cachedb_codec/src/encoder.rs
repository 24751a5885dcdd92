//! Deterministic encoder.

use crate::value::Value;
use bytes::BufMut;

/// CBOR tag for decimal fractions (RFC 8949 §3.4.4).
pub const DECIMAL_TAG: u64 = 4;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;

const FALSE: u8 = 0xf4;
const TRUE: u8 = 0xf5;
const NULL: u8 = 0xf6;

/// Encodes `value` deterministically.
///
/// Output follows the core deterministic rules of RFC 8949 §4.2.1:
/// shortest-form arguments, definite lengths only, and map entries ordered
/// by the bytewise order of their encoded keys. Equal values always produce
/// equal bytes.
pub fn to_canonical_cbor(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

fn write_head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let major = major << 5;
    match arg {
        0..=23 => out.put_u8(major | arg as u8),
        24..=0xff => {
            out.put_u8(major | 24);
            out.put_u8(arg as u8);
        }
        0x100..=0xffff => {
            out.put_u8(major | 25);
            out.put_u16(arg as u16);
        }
        0x1_0000..=0xffff_ffff => {
            out.put_u8(major | 26);
            out.put_u32(arg as u32);
        }
        _ => {
            out.put_u8(major | 27);
            out.put_u64(arg);
        }
    }
}

fn write_integer(out: &mut Vec<u8>, n: i64) {
    match u64::try_from(n) {
        Ok(u) => write_head(out, MAJOR_UNSIGNED, u),
        // -1 - n is non-negative for every negative i64
        Err(_) => write_head(out, MAJOR_NEGATIVE, (-1 - n) as u64),
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.put_u8(NULL),
        Value::Bool(b) => out.put_u8(if *b { TRUE } else { FALSE }),
        Value::Integer(n) => write_integer(out, *n),
        Value::Bytes(b) => {
            write_head(out, MAJOR_BYTES, b.len() as u64);
            out.put_slice(b);
        }
        Value::Text(s) => {
            write_head(out, MAJOR_TEXT, s.len() as u64);
            out.put_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_head(out, MAJOR_ARRAY, items.len() as u64);
            for item in items {
                write_value(out, item);
            }
        }
        Value::Map(pairs) => {
            let mut entries: Vec<(Vec<u8>, &Value)> = pairs
                .iter()
                .map(|(k, v)| (to_canonical_cbor(k), v))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            write_head(out, MAJOR_MAP, entries.len() as u64);
            for (key, v) in entries {
                out.put_slice(&key);
                write_value(out, v);
            }
        }
        Value::Decimal(d) => {
            write_head(out, MAJOR_TAG, DECIMAL_TAG);
            write_head(out, MAJOR_ARRAY, 2);
            write_integer(out, i64::from(d.exponent()));
            write_integer(out, d.mantissa());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Decimal;

    #[test]
    fn integers_use_shortest_form() {
        assert_eq!(to_canonical_cbor(&Value::Integer(0)), [0x00]);
        assert_eq!(to_canonical_cbor(&Value::Integer(23)), [0x17]);
        assert_eq!(to_canonical_cbor(&Value::Integer(24)), [0x18, 24]);
        assert_eq!(to_canonical_cbor(&Value::Integer(1000)), [0x19, 0x03, 0xe8]);
        assert_eq!(to_canonical_cbor(&Value::Integer(-1)), [0x20]);
        assert_eq!(to_canonical_cbor(&Value::Integer(-500)), [0x39, 0x01, 0xf3]);
        assert_eq!(
            to_canonical_cbor(&Value::Integer(i64::MIN)),
            [0x3b, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn simple_values() {
        assert_eq!(to_canonical_cbor(&Value::Null), [0xf6]);
        assert_eq!(to_canonical_cbor(&Value::Bool(true)), [0xf5]);
        assert_eq!(to_canonical_cbor(&Value::Bool(false)), [0xf4]);
    }

    #[test]
    fn decimal_is_tag_four() {
        // 273.15 = 27315 * 10^-2 → C4 82 21 19 6AB3 (RFC 8949 example)
        let bytes = to_canonical_cbor(&Value::Decimal(Decimal::new(27315, -2)));
        assert_eq!(bytes, [0xc4, 0x82, 0x21, 0x19, 0x6a, 0xb3]);
    }

    #[test]
    fn map_order_ignores_construction_order() {
        let a = Value::Map(vec![
            (Value::from("b"), Value::Integer(2)),
            (Value::from("a"), Value::Integer(1)),
        ]);
        let b = Value::map(vec![
            (Value::from("a"), Value::Integer(1)),
            (Value::from("b"), Value::Integer(2)),
        ]);
        assert_eq!(to_canonical_cbor(&a), to_canonical_cbor(&b));
    }
}
