//! Compiled code requirements.
//!
//! Signed bundles carry a designated requirement equivalent to
//!
//! ```text
//! identifier "<id>" and anchor apple generic
//!     and certificate leaf[subject.CN] = "<common name>"
//!     and certificate 1[field.1.2.840.113635.100.6.2.1] exists
//! ```
//!
//! encoded in the binary requirement language (big-endian opcodes, data
//! items length-prefixed and padded to four bytes).

use super::constants::*;

struct Expr(Vec<u8>);

impl Expr {
    fn op(op: u32) -> Self {
        Expr(op.to_be_bytes().to_vec())
    }

    fn data(mut self, bytes: &[u8]) -> Self {
        self.0.extend((bytes.len() as u32).to_be_bytes());
        self.0.extend_from_slice(bytes);
        let pad = (4 - bytes.len() % 4) % 4;
        self.0.extend(std::iter::repeat(0u8).take(pad));
        self
    }

    fn int(mut self, value: i32) -> Self {
        self.0.extend(value.to_be_bytes());
        self
    }

    fn word(mut self, value: u32) -> Self {
        self.0.extend(value.to_be_bytes());
        self
    }

    fn and(left: Expr, right: Expr) -> Self {
        let mut out = Expr::op(OP_AND);
        out.0.extend(left.0);
        out.0.extend(right.0);
        out
    }
}

/// DER content octets of a dotted OID string.
fn encode_oid(dotted: &str) -> Vec<u8> {
    let arcs: Vec<u64> = dotted.split('.').filter_map(|a| a.parse().ok()).collect();
    let mut out = Vec::new();
    if arcs.len() < 2 {
        return out;
    }
    let mut push_arc = |mut value: u64| {
        let mut chunk = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            chunk.push(((value & 0x7f) as u8) | 0x80);
            value >>= 7;
        }
        chunk.reverse();
        out.extend(chunk);
    };
    push_arc(arcs[0] * 40 + arcs[1]);
    for arc in &arcs[2..] {
        push_arc(*arc);
    }
    out
}

/// Build a requirements set holding one designated requirement.
///
/// Without a signer common name only the identifier clause is emitted.
pub fn build_designated_requirements(identifier: &str, common_name: Option<&str>) -> Vec<u8> {
    let ident = Expr::op(OP_IDENT).data(identifier.as_bytes());
    let expr = match common_name {
        Some(cn) => {
            let leaf = Expr::op(OP_CERT_FIELD)
                .int(CERT_INDEX_LEAF)
                .data(b"subject.CN")
                .word(MATCH_EQUAL)
                .data(cn.as_bytes());
            let intermediate = Expr::op(OP_CERT_GENERIC)
                .int(CERT_INDEX_INTERMEDIATE)
                .data(&encode_oid(WWDR_INTERMEDIATE_OID))
                .word(MATCH_EXISTS);
            Expr::and(
                ident,
                Expr::and(
                    Expr::op(OP_APPLE_GENERIC_ANCHOR),
                    Expr::and(leaf, intermediate),
                ),
            )
        }
        None => ident,
    };

    // Requirement blob: magic, length, kind 1 (expression), expression
    let req_len = 12 + expr.0.len() as u32;
    let mut requirement = Vec::with_capacity(req_len as usize);
    requirement.extend(CSMAGIC_REQUIREMENT.to_be_bytes());
    requirement.extend(req_len.to_be_bytes());
    requirement.extend(1u32.to_be_bytes());
    requirement.extend(expr.0);

    // Requirements set: magic, length, count, (type, offset), requirement
    let header_len = 12 + 8;
    let total_len = header_len + requirement.len() as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(CSMAGIC_REQUIREMENTS.to_be_bytes());
    buf.extend(total_len.to_be_bytes());
    buf.extend(1u32.to_be_bytes());
    buf.extend(CSREQ_DESIGNATED.to_be_bytes());
    buf.extend(header_len.to_be_bytes());
    buf.extend(requirement);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::code_directory::be_u32;

    #[test]
    fn test_wwdr_oid_encoding() {
        assert_eq!(
            encode_oid(WWDR_INTERMEDIATE_OID),
            vec![0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01]
        );
    }

    #[test]
    fn test_identifier_only() {
        let blob = build_designated_requirements("com.example.app", None);
        assert_eq!(be_u32(&blob, 0), Some(CSMAGIC_REQUIREMENTS));
        assert_eq!(be_u32(&blob, 4), Some(blob.len() as u32));
        assert_eq!(be_u32(&blob, 12), Some(CSREQ_DESIGNATED));
        assert_eq!(be_u32(&blob, 20), Some(CSMAGIC_REQUIREMENT));
        assert_eq!(be_u32(&blob, 32), Some(OP_IDENT));
        assert_eq!(be_u32(&blob, 36), Some(15));
        // 15 bytes of identifier padded to 16
        assert_eq!(blob.len(), 20 + 12 + 4 + 4 + 16);
    }

    #[test]
    fn test_full_requirement_mentions_signer() {
        let blob = build_designated_requirements("com.example.app", Some("Apple Development: a@b.c (X)"));
        assert_eq!(be_u32(&blob, 32), Some(OP_AND));
        assert!(blob.windows(10).any(|w| w == b"subject.CN"));
        assert!(blob.windows(17).any(|w| w == b"Apple Development"));
        assert_eq!(blob.len() % 4, 0);
    }
}
