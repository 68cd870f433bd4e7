//! The frozen canonicalization contract behind node identity.
//!
//! `NodeId = H(serialize(operator) || serialize(arg_0) || … || attributes)`
//! with `H` = SHA-256. A named operator serializes as its raw UTF-8
//! bytes; a constant as a type tag plus its binary form. Each argument
//! serializes as its lowercase-hex id, and every field is
//! length-prefixed so no two distinct operations share a byte string.
//!
//! Any change here changes every node identity in every store. Bump
//! [`RUNTIME_VERSION`] when touching anything in this file.

use crate::workplan::{ConstValue, NodeId, Operation, Operator};
use sha2::{Digest, Sha256};

/// Identifies the semantics of this build. Participates in every store
/// key; prior records under other versions are opaque historical data.
pub const RUNTIME_VERSION: &str = "vox2-1";

const OP_INT: u8 = b'i';
const OP_FLOAT: u8 = b'f';
const OP_BOOL: u8 = b'b';
const OP_STRING: u8 = b's';
const OP_NULL: u8 = b'n';

/// Compute the content hash identifying `op`.
pub fn node_id(op: &Operation) -> NodeId {
    let mut buf = Vec::new();
    write_len_prefixed(&mut buf, &operator_bytes(&op.operator));
    for arg in &op.arguments {
        write_len_prefixed(&mut buf, arg.to_hex().as_bytes());
    }
    for (key, value) in &op.attributes {
        write_len_prefixed(&mut buf, key.as_bytes());
        write_len_prefixed(&mut buf, value.as_bytes());
    }
    let digest = Sha256::digest(&buf);
    NodeId::from_bytes(digest.into())
}

/// Canonical bytes of an operator: raw UTF-8 for named primitives, one
/// tag byte plus the binary form for constants.
pub fn operator_bytes(operator: &Operator) -> Vec<u8> {
    let mut out = Vec::new();
    match operator {
        Operator::Named(name) => {
            out.extend_from_slice(name.as_bytes());
        }
        Operator::Const(ConstValue::Integer(v)) => {
            out.push(OP_INT);
            out.extend_from_slice(&int_to_minimal_be(*v));
        }
        Operator::Const(ConstValue::Float(v)) => {
            out.push(OP_FLOAT);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Operator::Const(ConstValue::Boolean(v)) => {
            out.push(OP_BOOL);
            out.push(u8::from(*v));
        }
        Operator::Const(ConstValue::String(v)) => {
            out.push(OP_STRING);
            out.extend_from_slice(&(v.len() as u32).to_be_bytes());
            out.extend_from_slice(v.as_bytes());
        }
        Operator::Const(ConstValue::Null) => {
            out.push(OP_NULL);
        }
    }
    out
}

/// Minimum-length two's-complement big-endian form of `v`.
fn int_to_minimal_be(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant_zero = bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0;
        let redundant_ff = bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0;
        if redundant_zero || redundant_ff {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn named_operators_serialize_as_raw_utf8() {
        assert_eq!(operator_bytes(&Operator::Named("+".into())), b"+".to_vec());
        assert_eq!(
            operator_bytes(&Operator::Named("seq.range".into())),
            b"seq.range".to_vec()
        );
    }

    #[test]
    fn identical_operations_hash_identically() {
        let a = Operation::constant(ConstValue::Integer(7));
        let b = Operation::constant(ConstValue::Integer(7));
        assert_eq!(node_id(&a), node_id(&b));
    }

    #[test]
    fn operator_name_distinguishes_nodes() {
        let one = node_id(&Operation::constant(ConstValue::Integer(1)));
        let plus = Operation::named("+", vec![one, one]);
        let minus = Operation::named("-", vec![one, one]);
        assert_ne!(node_id(&plus), node_id(&minus));
    }

    #[test]
    fn argument_order_distinguishes_nodes() {
        let one = node_id(&Operation::constant(ConstValue::Integer(1)));
        let two = node_id(&Operation::constant(ConstValue::Integer(2)));
        let ab = Operation::named("-", vec![one, two]);
        let ba = Operation::named("-", vec![two, one]);
        assert_ne!(node_id(&ab), node_id(&ba));
    }

    #[test]
    fn attributes_participate_in_identity() {
        let mut with = Operation::named("load", vec![]);
        with.attributes.insert("mode".into(), "strict".into());
        let without = Operation::named("load", vec![]);
        assert_ne!(node_id(&with), node_id(&without));
    }

    #[test]
    fn constants_of_different_types_differ() {
        // 1 as integer, 1.0 as float, "1" as string, true as boolean.
        let ids = [
            node_id(&Operation::constant(ConstValue::Integer(1))),
            node_id(&Operation::constant(ConstValue::Float(1.0))),
            node_id(&Operation::constant(ConstValue::String("1".into()))),
            node_id(&Operation::constant(ConstValue::Boolean(true))),
            node_id(&Operation::constant(ConstValue::Null)),
        ];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn minimal_int_encoding() {
        assert_eq!(int_to_minimal_be(0), vec![0x00]);
        assert_eq!(int_to_minimal_be(1), vec![0x01]);
        assert_eq!(int_to_minimal_be(-1), vec![0xff]);
        assert_eq!(int_to_minimal_be(127), vec![0x7f]);
        assert_eq!(int_to_minimal_be(128), vec![0x00, 0x80]);
        assert_eq!(int_to_minimal_be(-128), vec![0x80]);
        assert_eq!(int_to_minimal_be(-129), vec![0xff, 0x7f]);
        assert_eq!(int_to_minimal_be(i64::MAX).len(), 8);
        assert_eq!(int_to_minimal_be(i64::MIN).len(), 8);
    }

    proptest! {
        #[test]
        fn minimal_int_is_sign_preserving(v in any::<i64>()) {
            let enc = int_to_minimal_be(v);
            prop_assert!(!enc.is_empty());
            // Reconstruct by sign-extension.
            let negative = enc[0] & 0x80 != 0;
            let mut full = [if negative { 0xff } else { 0x00 }; 8];
            full[8 - enc.len()..].copy_from_slice(&enc);
            prop_assert_eq!(i64::from_be_bytes(full), v);
        }

        #[test]
        fn distinct_ints_hash_distinctly(a in any::<i64>(), b in any::<i64>()) {
            prop_assume!(a != b);
            let ia = node_id(&Operation::constant(ConstValue::Integer(a)));
            let ib = node_id(&Operation::constant(ConstValue::Integer(b)));
            prop_assert_ne!(ia, ib);
        }
    }
}
