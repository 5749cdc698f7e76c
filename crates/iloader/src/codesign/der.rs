//! DER encoding of entitlements for the slot -7 blob.
//!
//! Layout follows what `codesign` emits:
//!
//! ```text
//! [APPLICATION 16] {
//!     INTEGER 1,
//!     [CONTEXT 16] { SEQUENCE { UTF8String key, value } ... }
//! }
//! ```
//!
//! Dictionaries are `[CONTEXT 16]` with pairs sorted by key, arrays are
//! `SEQUENCE`. Data, date and real values never appear in entitlements and
//! are rejected.

use plist::{Dictionary, Value};

use crate::{Error, Result};

const DER_TAG_BOOLEAN: u8 = 0x01;
const DER_TAG_INTEGER: u8 = 0x02;
const DER_TAG_UTF8STRING: u8 = 0x0c;
const DER_TAG_SEQUENCE: u8 = 0x30;
const DER_TAG_DICTIONARY: u8 = 0xb0;
const DER_TAG_ENTITLEMENTS: u8 = 0x70;

fn encode_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        output.push(length as u8);
    } else {
        let bytes_needed = (64 - (length as u64).leading_zeros() as usize).div_ceil(8);
        output.push(0x80 | bytes_needed as u8);
        for i in (0..bytes_needed).rev() {
            output.push(((length >> (i * 8)) & 0xff) as u8);
        }
    }
}

fn encode_tlv(output: &mut Vec<u8>, tag: u8, content: &[u8]) {
    output.push(tag);
    encode_length(output, content.len());
    output.extend_from_slice(content);
}

fn encode_integer(output: &mut Vec<u8>, value: i64) {
    // Minimal two's complement big-endian
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    encode_tlv(output, DER_TAG_INTEGER, &bytes[start..]);
}

fn encode_dictionary(output: &mut Vec<u8>, dict: &Dictionary) -> Result<()> {
    let mut keys: Vec<&String> = dict.keys().collect();
    keys.sort();

    let mut content = Vec::new();
    for key in keys {
        let mut pair = Vec::new();
        encode_tlv(&mut pair, DER_TAG_UTF8STRING, key.as_bytes());
        if let Some(value) = dict.get(key) {
            encode_value(&mut pair, value)?;
        }
        encode_tlv(&mut content, DER_TAG_SEQUENCE, &pair);
    }
    encode_tlv(output, DER_TAG_DICTIONARY, &content);
    Ok(())
}

fn encode_value(output: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Boolean(b) => encode_tlv(output, DER_TAG_BOOLEAN, &[if *b { 0xff } else { 0x00 }]),
        Value::Integer(i) => {
            let v = i
                .as_signed()
                .ok_or_else(|| Error::Signing("entitlement integer out of range".into()))?;
            encode_integer(output, v);
        }
        Value::String(s) => encode_tlv(output, DER_TAG_UTF8STRING, s.as_bytes()),
        Value::Array(items) => {
            let mut content = Vec::new();
            for item in items {
                encode_value(&mut content, item)?;
            }
            encode_tlv(output, DER_TAG_SEQUENCE, &content);
        }
        Value::Dictionary(dict) => encode_dictionary(output, dict)?,
        other => {
            return Err(Error::Signing(format!(
                "unsupported entitlement value type: {other:?}"
            )))
        }
    }
    Ok(())
}

/// Encode an entitlements dictionary as DER.
pub fn entitlements_to_der(entitlements: &Dictionary) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    encode_integer(&mut content, 1);
    encode_dictionary(&mut content, entitlements)?;

    let mut output = Vec::new();
    encode_tlv(&mut output, DER_TAG_ENTITLEMENTS, &content);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_length_long() {
        let mut buf = Vec::new();
        encode_length(&mut buf, 256);
        assert_eq!(buf, vec![0x82, 0x01, 0x00]);
    }

    #[test]
    fn test_encode_integer_sign_padding() {
        let cases: [(i64, &[u8]); 4] = [
            (0, &[0x00]),
            (42, &[0x2a]),
            (128, &[0x00, 0x80]),
            (256, &[0x01, 0x00]),
        ];
        for (value, expected) in cases {
            let mut buf = Vec::new();
            encode_integer(&mut buf, value);
            assert_eq!(&buf[2..], expected, "value {value}");
            assert_eq!(buf[1] as usize, expected.len());
        }
    }

    #[test]
    fn test_empty_entitlements() {
        let der = entitlements_to_der(&Dictionary::new()).unwrap();
        assert_eq!(der, vec![0x70, 0x05, 0x02, 0x01, 0x01, 0xb0, 0x00]);
    }

    #[test]
    fn test_keys_are_sorted() {
        let mut dict = Dictionary::new();
        dict.insert("get-task-allow".into(), Value::Boolean(true));
        dict.insert("application-identifier".into(), Value::String("T.app".into()));
        let der = entitlements_to_der(&dict).unwrap();

        let app = der.windows(22).position(|w| w == b"application-identifier");
        let gta = der.windows(14).position(|w| w == b"get-task-allow");
        assert!(app.unwrap() < gta.unwrap());
    }

    #[test]
    fn test_rejects_data_values() {
        let mut dict = Dictionary::new();
        dict.insert("blob".into(), Value::Data(vec![1, 2, 3]));
        assert!(entitlements_to_der(&dict).is_err());
    }
}
