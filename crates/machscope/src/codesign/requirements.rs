//! Code requirement sets and a decompiler for the requirement language.
//!
//! A requirements blob (slot 2) indexes one requirement per type
//! (host, guest, designated, library, plugin). Each requirement is a
//! `0xfade0c00` blob holding a prefix-encoded expression:
//!
//! ```text
//! requirement set                  requirement
//! ┌──────────────────────┐         ┌──────────────────────┐
//! │ magic  length  count │         │ magic  length  kind  │
//! │ (type, offset) × n ──┼────────►│ op [operands] op ... │
//! └──────────────────────┘         └──────────────────────┘
//! ```
//!
//! Operands are big-endian `u32`/`i32` values or length-prefixed byte
//! strings padded to four bytes. Expressions that use unknown opcodes or
//! are cut short are kept as a hex dump instead of failing the decode.

use super::constants::*;
use crate::{Error, Result};
use bcder::Oid;
use scroll::{Pread, BE};

/// Expression form of a requirement blob.
const EXPR_FORM: u32 = 1;

/// Expression nesting bound.
const MAX_DEPTH: usize = 32;

/// A decoded requirement set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementSet {
    /// Length of the whole blob, header included
    pub length: u32,
    pub requirements: Vec<Requirement>,
}

/// One requirement and its decompiled expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Requirement type (`CSREQ_*`)
    pub kind: u32,
    /// Offset of the requirement blob within the set
    pub offset: u32,
    /// Length of the requirement blob
    pub length: u32,
    /// Expression text, or a hex dump when `decompiled` is false
    pub detail: String,
    pub decompiled: bool,
}

impl Requirement {
    pub fn kind_name(&self) -> &'static str {
        requirement_type_name(self.kind)
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} => {}", self.kind_name(), self.detail)
    }
}

fn malformed(msg: String) -> Error {
    Error::MalformedSignature(format!("requirements: {}", msg))
}

impl RequirementSet {
    /// Decode a requirement set blob (slot 2).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSignature`] if the index or a requirement
    /// blob lies outside the set or carries the wrong magic. Expression
    /// problems do not fail the decode.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let u32_at = |off: usize| -> Result<u32> {
            blob.pread_with::<u32>(off, BE)
                .map_err(|e| malformed(format!("read at {:#x}: {}", off, e)))
        };
        let magic = u32_at(0)?;
        if magic != CSMAGIC_REQUIREMENTS {
            return Err(malformed(format!("bad magic {:#010x}", magic)));
        }
        let length = u32_at(4)?;
        let total = length as usize;
        if total > blob.len() {
            return Err(malformed(format!("length {:#x} exceeds blob", length)));
        }
        let count = u32_at(8)?;
        let index_end = 12 + count as usize * 8;
        if index_end > total {
            return Err(malformed(format!("index of {} entries exceeds length", count)));
        }

        let mut requirements = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let kind = u32_at(12 + i * 8)?;
            let offset = u32_at(16 + i * 8)?;
            let start = offset as usize;
            if start < index_end || start + 12 > total {
                return Err(malformed(format!("requirement offset {:#x} outside set", offset)));
            }
            let req_magic = u32_at(start)?;
            let req_len = u32_at(start + 4)?;
            if req_magic != CSMAGIC_REQUIREMENT {
                return Err(malformed(format!("requirement magic {:#010x}", req_magic)));
            }
            if (req_len as usize) < 12 || start + req_len as usize > total {
                return Err(malformed(format!(
                    "requirement at {:#x} declares length {:#x}",
                    offset, req_len
                )));
            }
            let form = u32_at(start + 8)?;
            let expr = &blob[start + 12..start + req_len as usize];
            let (detail, decompiled) = if form == EXPR_FORM {
                match decompile(expr) {
                    Some(text) => (text, true),
                    None => (hex_dump(expr), false),
                }
            } else {
                (hex_dump(expr), false)
            };
            if !decompiled {
                tracing::warn!(kind, offset, "requirement kept as hex dump");
            }
            requirements.push(Requirement {
                kind,
                offset,
                length: req_len,
                detail,
                decompiled,
            });
        }

        Ok(Self {
            length,
            requirements,
        })
    }

    pub fn designated(&self) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.kind == CSREQ_DESIGNATED)
    }
}

/// Decompile a whole expression; `None` if any part is not understood or
/// bytes are left over.
pub fn decompile(expr: &[u8]) -> Option<String> {
    let mut reader = ExprReader { data: expr, pos: 0 };
    let (text, _) = reader.expr(0)?;
    (reader.pos == expr.len()).then_some(text)
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Binding strength used to parenthesise nested expressions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Or,
    And,
    Primary,
}

struct ExprReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ExprReader<'a> {
    fn u32(&mut self) -> Option<u32> {
        let v = self.data.pread_with::<u32>(self.pos, BE).ok()?;
        self.pos += 4;
        Some(v)
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn i64(&mut self) -> Option<i64> {
        let v = self.data.pread_with::<i64>(self.pos, BE).ok()?;
        self.pos += 8;
        Some(v)
    }

    /// Length-prefixed bytes, padded to a four byte boundary.
    fn data(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end.checked_add(3)? & !3;
        if self.pos > self.data.len() {
            return None;
        }
        Some(bytes)
    }

    fn string(&mut self) -> Option<String> {
        self.data().map(quote)
    }

    fn hash(&mut self) -> Option<String> {
        self.data().map(|d| format!("H\"{}\"", hex_dump(d)))
    }

    fn oid(&mut self) -> Option<String> {
        self.data().map(|d| Oid(d).to_string())
    }

    fn cert_slot(&mut self) -> Option<String> {
        Some(match self.i32()? {
            -1 => "anchor".to_string(),
            0 => "leaf".to_string(),
            n => n.to_string(),
        })
    }

    fn match_suffix(&mut self) -> Option<String> {
        let op = self.u32()?;
        Some(match op {
            MATCH_EXISTS => " /* exists */".to_string(),
            MATCH_ABSENT => " absent".to_string(),
            MATCH_EQUAL => format!(" = {}", self.string()?),
            MATCH_CONTAINS => format!(" ~ {}", self.string()?),
            MATCH_BEGINS_WITH => format!(" = {}*", self.string()?),
            MATCH_ENDS_WITH => format!(" = *{}", self.string()?),
            MATCH_LESS_THAN => format!(" < {}", self.string()?),
            MATCH_GREATER_THAN => format!(" > {}", self.string()?),
            MATCH_LESS_THAN_OR_EQUAL => format!(" <= {}", self.string()?),
            MATCH_GREATER_THAN_OR_EQUAL => format!(" >= {}", self.string()?),
            MATCH_ON => format!(" = timestamp {}", self.i64()?),
            MATCH_BEFORE => format!(" < timestamp {}", self.i64()?),
            MATCH_AFTER => format!(" > timestamp {}", self.i64()?),
            MATCH_ON_OR_BEFORE => format!(" <= timestamp {}", self.i64()?),
            MATCH_ON_OR_AFTER => format!(" >= timestamp {}", self.i64()?),
            _ => return None,
        })
    }

    fn child(&mut self, depth: usize, min: Prec) -> Option<String> {
        let (text, prec) = self.expr(depth + 1)?;
        Some(if prec < min { format!("({})", text) } else { text })
    }

    fn expr(&mut self, depth: usize) -> Option<(String, Prec)> {
        if depth > MAX_DEPTH {
            return None;
        }
        let raw = self.u32()?;
        let op = raw & OP_TYPE_MASK;
        let primary = |text: String| Some((text, Prec::Primary));
        match op {
            OP_FALSE => primary("never".into()),
            OP_TRUE => primary("always".into()),
            OP_IDENT => primary(format!("identifier {}", self.string()?)),
            OP_APPLE_ANCHOR => primary("anchor apple".into()),
            OP_APPLE_GENERIC_ANCHOR => primary("anchor apple generic".into()),
            OP_ANCHOR_HASH => {
                let slot = self.cert_slot()?;
                primary(format!("certificate {} = {}", slot, self.hash()?))
            }
            OP_INFO_KEY_VALUE => {
                let key = self.string()?;
                primary(format!("info[{}] = {}", unquote(&key), self.string()?))
            }
            OP_AND => {
                let lhs = self.child(depth, Prec::And)?;
                let rhs = self.child(depth, Prec::And)?;
                Some((format!("{} and {}", lhs, rhs), Prec::And))
            }
            OP_OR => {
                let lhs = self.child(depth, Prec::Or)?;
                let rhs = self.child(depth, Prec::Or)?;
                Some((format!("{} or {}", lhs, rhs), Prec::Or))
            }
            OP_NOT => primary(format!("! {}", self.child(depth, Prec::Primary)?)),
            OP_CDHASH => primary(format!("cdhash {}", self.hash()?)),
            OP_INFO_KEY_FIELD => {
                let key = self.string()?;
                primary(format!("info[{}]{}", unquote(&key), self.match_suffix()?))
            }
            OP_ENTITLEMENT_FIELD => {
                let key = self.string()?;
                primary(format!("entitlement[{}]{}", quote_key(&key), self.match_suffix()?))
            }
            OP_CERT_FIELD => {
                let slot = self.cert_slot()?;
                let field = self.string()?;
                primary(format!("certificate {}[{}]{}", slot, unquote(&field), self.match_suffix()?))
            }
            OP_CERT_GENERIC => {
                let slot = self.cert_slot()?;
                let oid = self.oid()?;
                primary(format!("certificate {}[field.{}]{}", slot, oid, self.match_suffix()?))
            }
            OP_CERT_POLICY => {
                let slot = self.cert_slot()?;
                let oid = self.oid()?;
                primary(format!("certificate {}[policy.{}]{}", slot, oid, self.match_suffix()?))
            }
            OP_CERT_FIELD_DATE => {
                let slot = self.cert_slot()?;
                let oid = self.oid()?;
                primary(format!("certificate {}[timestamp.{}]{}", slot, oid, self.match_suffix()?))
            }
            OP_TRUSTED_CERT => primary(format!("certificate {} trusted", self.cert_slot()?)),
            OP_TRUSTED_CERTS => primary("anchor trusted".into()),
            OP_NAMED_ANCHOR => primary(format!("anchor apple {}", unquote(&self.string()?))),
            OP_NAMED_CODE => primary(format!("({})", unquote(&self.string()?))),
            OP_PLATFORM => primary(format!("platform = {}", self.u32()?)),
            OP_NOTARIZED => primary("notarized".into()),
            OP_LEGACY_DEV_ID => primary("legacy".into()),
            // unknown opcodes flagged as skippable carry one data operand
            _ if raw & OP_FLAG_DEFAULT_FALSE != 0 => {
                self.data()?;
                primary(format!("never /* opcode {:#x} */", op))
            }
            _ if raw & OP_FLAG_SKIP != 0 => {
                self.data()?;
                primary(format!("/* opcode {:#x} */", op))
            }
            _ => None,
        }
    }
}

/// Render operand bytes as a quoted string, or as hex when not text.
fn quote(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
        _ => format!("H\"{}\"", hex_dump(bytes)),
    }
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s)
}

fn quote_key(s: &str) -> String {
    if s.starts_with('"') {
        s.to_string()
    } else {
        format!("\"{}\"", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(v: u32) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    fn data(bytes: &[u8]) -> Vec<u8> {
        let mut out = (bytes.len() as u32).to_be_bytes().to_vec();
        out.extend(bytes);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn requirement_set(exprs: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut blobs = Vec::new();
        for (_, expr) in exprs {
            let mut b = CSMAGIC_REQUIREMENT.to_be_bytes().to_vec();
            b.extend(&(12 + expr.len() as u32).to_be_bytes());
            b.extend(&EXPR_FORM.to_be_bytes());
            b.extend(expr);
            blobs.push(b);
        }
        let header = 12 + exprs.len() * 8;
        let total = header + blobs.iter().map(Vec::len).sum::<usize>();
        let mut out = CSMAGIC_REQUIREMENTS.to_be_bytes().to_vec();
        out.extend(&(total as u32).to_be_bytes());
        out.extend(&(exprs.len() as u32).to_be_bytes());
        let mut offset = header as u32;
        for ((kind, _), blob) in exprs.iter().zip(&blobs) {
            out.extend(&kind.to_be_bytes());
            out.extend(&offset.to_be_bytes());
            offset += blob.len() as u32;
        }
        for blob in blobs {
            out.extend(blob);
        }
        out
    }

    fn designated_expr() -> Vec<u8> {
        // identifier "com.example.app" and anchor apple generic and
        // certificate leaf[subject.CN] = "Apple Development: dev"
        let mut e = op(OP_AND);
        e.extend(op(OP_AND));
        e.extend(op(OP_IDENT));
        e.extend(data(b"com.example.app"));
        e.extend(op(OP_APPLE_GENERIC_ANCHOR));
        e.extend(op(OP_CERT_FIELD));
        e.extend(op(0));
        e.extend(data(b"subject.CN"));
        e.extend(op(MATCH_EQUAL));
        e.extend(data(b"Apple Development: dev"));
        e
    }

    #[test]
    fn test_decompile_designated() {
        let text = decompile(&designated_expr()).unwrap();
        assert_eq!(
            text,
            "identifier \"com.example.app\" and anchor apple generic and \
             certificate leaf[subject.CN] = \"Apple Development: dev\""
        );
    }

    #[test]
    fn test_or_inside_and_is_parenthesised() {
        let mut e = op(OP_AND);
        e.extend(op(OP_OR));
        e.extend(op(OP_TRUE));
        e.extend(op(OP_FALSE));
        e.extend(op(OP_NOT));
        e.extend(op(OP_NOTARIZED));
        assert_eq!(decompile(&e).unwrap(), "(always or never) and ! notarized");
    }

    #[test]
    fn test_cert_generic_oid() {
        // 1.2.840.113635.100.6.2.1
        let oid = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01];
        let mut e = op(OP_CERT_GENERIC);
        e.extend(op(1));
        e.extend(data(&oid));
        e.extend(op(MATCH_EXISTS));
        assert_eq!(
            decompile(&e).unwrap(),
            "certificate 1[field.1.2.840.113635.100.6.2.1] /* exists */"
        );
    }

    #[test]
    fn test_set_with_unknown_opcode_is_hex() {
        let bad = op(0x99);
        let blob = requirement_set(&[(CSREQ_DESIGNATED, designated_expr()), (CSREQ_HOST, bad)]);
        let set = RequirementSet::parse(&blob).unwrap();

        assert_eq!(set.length as usize, blob.len());
        assert_eq!(set.requirements.len(), 2);
        let designated = set.designated().unwrap();
        assert!(designated.decompiled);
        assert!(designated.to_string().starts_with("designated => identifier"));
        assert!(!set.requirements[1].decompiled);
        assert_eq!(set.requirements[1].detail, "00000099");
    }

    #[test]
    fn test_flagged_unknown_opcodes() {
        let mut e = op(OP_AND);
        e.extend(op(OP_FLAG_SKIP | 0x77));
        e.extend(data(b"future"));
        e.extend(op(OP_FLAG_DEFAULT_FALSE | 0x78));
        e.extend(data(b""));
        assert_eq!(
            decompile(&e).unwrap(),
            "/* opcode 0x77 */ and never /* opcode 0x78 */"
        );
    }

    #[test]
    fn test_truncated_operand_is_hex() {
        let mut e = op(OP_IDENT);
        e.extend(&100u32.to_be_bytes());
        assert!(decompile(&e).is_none());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let mut e = Vec::new();
        for _ in 0..40 {
            e.extend(op(OP_NOT));
        }
        e.extend(op(OP_TRUE));
        assert!(decompile(&e).is_none());
    }

    #[test]
    fn test_bad_entry_offset() {
        let mut blob = requirement_set(&[(CSREQ_DESIGNATED, op(OP_TRUE))]);
        blob[16..20].copy_from_slice(&0x400u32.to_be_bytes());
        assert!(matches!(RequirementSet::parse(&blob), Err(Error::MalformedSignature(_))));
    }
}
