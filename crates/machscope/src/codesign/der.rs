//! DER (Distinguished Encoding Rules) decoder for entitlements
//!
//! Slot 7 of a code signature carries the entitlements a second time, as
//! DER. This module turns that encoding back into a [`plist::Value`].
//!
//! The encoding uses the following ASN.1 DER tags:
//! - 0x01: BOOLEAN
//! - 0x02: INTEGER
//! - 0x04: OCTET STRING (data)
//! - 0x0c: UTF8String
//! - 0x30: SEQUENCE (arrays, and each dictionary key/value pair)
//! - 0x31: SET (dictionaries)
//!
//! Newer signers wrap the dictionary as
//! `[APPLICATION 16] { INTEGER version, [CONTEXT 16] { pairs } }`.

use crate::{Error, Result};
use plist::{Dictionary, Value};

const DER_TAG_BOOLEAN: u8 = 0x01;
const DER_TAG_INTEGER: u8 = 0x02;
const DER_TAG_OCTET_STRING: u8 = 0x04;
const DER_TAG_UTF8STRING: u8 = 0x0c;
const DER_TAG_SEQUENCE: u8 = 0x30;
const DER_TAG_SET: u8 = 0x31;

/// `[APPLICATION 16]`, constructed
const DER_TAG_ENTITLEMENTS_WRAPPER: u8 = 0x70;

/// `[CONTEXT 16]`, constructed
const DER_TAG_ENTITLEMENTS_DICT: u8 = 0xb0;

/// Nesting bound for arrays and dictionaries
const MAX_DEPTH: usize = 64;

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedSignature(format!("DER entitlements: {}", msg.into()))
}

/// One tag-length-value element.
struct Element<'a> {
    tag: u8,
    content: &'a [u8],
}

/// Read one element from the front of `input`, returning it and the rest.
fn read_element(input: &[u8]) -> Result<(Element<'_>, &[u8])> {
    let (&tag, rest) = input.split_first().ok_or_else(|| malformed("missing tag"))?;
    let (&first, rest) = rest.split_first().ok_or_else(|| malformed("missing length"))?;

    let (length, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return Err(malformed(format!("bad long-form length {:#x}", first)));
        }
        let length = rest[..n].iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (length, &rest[n..])
    };

    if rest.len() < length {
        return Err(malformed(format!(
            "element {:#04x} needs {} bytes, {} left",
            tag,
            length,
            rest.len()
        )));
    }
    Ok((
        Element {
            tag,
            content: &rest[..length],
        },
        &rest[length..],
    ))
}

fn decode_integer(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(malformed(format!("integer of {} bytes", content.len())));
    }
    let negative = content[0] & 0x80 != 0;
    let init: i64 = if negative { -1 } else { 0 };
    Ok(content.iter().fold(init, |acc, &b| (acc << 8) | b as i64))
}

fn decode_string(content: &[u8]) -> Result<String> {
    String::from_utf8(content.to_vec()).map_err(|_| malformed("invalid UTF-8 string"))
}

/// Decode the key/value pairs making up a dictionary body.
fn decode_pairs(mut content: &[u8], depth: usize) -> Result<Value> {
    let mut dict = Dictionary::new();
    while !content.is_empty() {
        let (pair, rest) = read_element(content)?;
        if pair.tag != DER_TAG_SEQUENCE {
            return Err(malformed(format!("dictionary entry tag {:#04x}", pair.tag)));
        }
        let (key, value_bytes) = read_element(pair.content)?;
        if key.tag != DER_TAG_UTF8STRING {
            return Err(malformed(format!("dictionary key tag {:#04x}", key.tag)));
        }
        let (value, _) = read_element(value_bytes)?;
        dict.insert(decode_string(key.content)?, decode_value(&value, depth + 1)?);
        content = rest;
    }
    Ok(Value::Dictionary(dict))
}

fn decode_value(element: &Element<'_>, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(malformed("nesting too deep"));
    }
    let value = match element.tag {
        DER_TAG_BOOLEAN => Value::Boolean(element.content.first().is_some_and(|&b| b != 0)),
        DER_TAG_INTEGER => Value::Integer(decode_integer(element.content)?.into()),
        DER_TAG_OCTET_STRING => Value::Data(element.content.to_vec()),
        DER_TAG_UTF8STRING => Value::String(decode_string(element.content)?),
        DER_TAG_SEQUENCE => {
            let mut items = Vec::new();
            let mut rest = element.content;
            while !rest.is_empty() {
                let (item, next) = read_element(rest)?;
                items.push(decode_value(&item, depth + 1)?);
                rest = next;
            }
            Value::Array(items)
        }
        DER_TAG_SET | DER_TAG_ENTITLEMENTS_DICT => decode_pairs(element.content, depth)?,
        other => return Err(malformed(format!("unsupported tag {:#04x}", other))),
    };
    Ok(value)
}

/// Convert DER entitlements (slot 7 payload, without the blob header) to a plist value.
///
/// # Errors
///
/// Returns [`Error::MalformedSignature`] for truncated elements, unknown
/// tags, or non-string dictionary keys.
pub fn der_to_plist(der: &[u8]) -> Result<Value> {
    let (top, _) = read_element(der)?;
    if top.tag != DER_TAG_ENTITLEMENTS_WRAPPER {
        return decode_value(&top, 0);
    }

    let (version, rest) = read_element(top.content)?;
    if version.tag != DER_TAG_INTEGER {
        return Err(malformed("wrapper without version"));
    }
    let (dict, _) = read_element(rest)?;
    // some signers put a SET inside the context element
    if dict.tag == DER_TAG_ENTITLEMENTS_DICT {
        if let Some(&DER_TAG_SET) = dict.content.first() {
            let (set, _) = read_element(dict.content)?;
            return decode_value(&set, 0);
        }
    }
    decode_value(&dict, 0)
}
