//! Structural content hashes for subgraphs.
//!
//! A `ContentHash` identifies a subgraph independently of the arena it
//! lives in: node ids never enter the encoding, only op, dtype, argument,
//! tag and the hashes of the sources. Two kernel ASTs built in different
//! graphs (or sessions) hash equal exactly when they are structurally
//! equal, which is what the program cache keys on.

use std::collections::HashMap;

use super::{Arg, ConstValue, Graph, NodeId};
use crate::shape::{SInt, ShapeTracker, View};

const HASH_VERSION: u8 = 1;

// ─── Content Hash ──────────────────────────────────────────────────

/// A 256-bit BLAKE3 content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Display as full hex.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a 64-character hex string into a ContentHash.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(chunk[0])?;
            let lo = hex_digit(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Some(ContentHash(bytes))
    }

    /// Display as short base-32 (8 characters, 40 bits).
    pub fn to_short(&self) -> String {
        const ALPHABET: &[u8] = b"0123456789abcdefghjkmnpqrstuvwxyz";
        let val = u64::from_be_bytes([
            0, 0, 0, self.0[0], self.0[1], self.0[2], self.0[3], self.0[4],
        ]);
        let mut result = String::with_capacity(8);
        for i in (0..8).rev() {
            let idx = ((val >> (i * 5)) & 0x1F) as usize;
            result.push(ALPHABET[idx] as char);
        }
        result
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.to_short())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.to_short())
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ─── Encoding ──────────────────────────────────────────────────────

impl Graph {
    /// Content hash of the subgraph rooted at `root`.
    pub fn content_hash(&self, root: NodeId) -> ContentHash {
        let mut memo = HashMap::new();
        self.hash_into(root, &mut memo)
    }

    fn hash_into(&self, root: NodeId, memo: &mut HashMap<NodeId, ContentHash>) -> ContentHash {
        for id in self.toposort(root) {
            if memo.contains_key(&id) {
                continue;
            }
            let node = self.node(id);
            let mut buf = Vec::with_capacity(64);
            buf.push(HASH_VERSION);
            buf.push(node.op as u8);
            buf.push(node.dtype.code());
            match node.tag {
                Some(t) => {
                    buf.push(1);
                    buf.extend_from_slice(&t.to_le_bytes());
                }
                None => buf.push(0),
            }
            if let Arg::Kernel(k) = &node.arg {
                let ast = self.hash_into(k.ast, memo);
                buf.push(0xfe);
                buf.extend_from_slice(&ast.0);
                for m in &k.metadata {
                    encode_str(&mut buf, &m.name);
                    encode_str(&mut buf, &m.caller);
                }
            } else {
                encode_arg(&mut buf, &node.arg);
            }
            buf.extend_from_slice(&(node.src.len() as u32).to_le_bytes());
            for s in &node.src {
                buf.extend_from_slice(&memo[s].0);
            }
            memo.insert(id, ContentHash(*blake3::hash(&buf).as_bytes()));
        }
        memo[&root]
    }
}

fn encode_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn encode_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn encode_sint(buf: &mut Vec<u8>, v: &SInt) {
    match v {
        SInt::Const(c) => {
            buf.push(0);
            encode_i64(buf, *c);
        }
        SInt::Var(var) => {
            buf.push(1);
            encode_str(buf, &var.name);
            encode_i64(buf, var.min);
            encode_i64(buf, var.max);
        }
        SInt::Bound(var, val) => {
            buf.push(2);
            encode_str(buf, &var.name);
            encode_i64(buf, var.min);
            encode_i64(buf, var.max);
            encode_i64(buf, *val);
        }
        SInt::Sum(terms) | SInt::Prod(terms) => {
            buf.push(if matches!(v, SInt::Sum(_)) { 3 } else { 4 });
            buf.extend_from_slice(&(terms.len() as u32).to_le_bytes());
            for t in terms {
                encode_sint(buf, t);
            }
        }
    }
}

fn encode_sints(buf: &mut Vec<u8>, vs: &[SInt]) {
    buf.extend_from_slice(&(vs.len() as u32).to_le_bytes());
    for v in vs {
        encode_sint(buf, v);
    }
}

fn encode_view(buf: &mut Vec<u8>, v: &View) {
    encode_sints(buf, &v.shape);
    encode_sints(buf, &v.strides);
    encode_sint(buf, &v.offset);
    match &v.mask {
        Some(m) => {
            buf.push(1);
            for (b, e) in m {
                encode_sint(buf, b);
                encode_sint(buf, e);
            }
        }
        None => buf.push(0),
    }
}

fn encode_st(buf: &mut Vec<u8>, st: &ShapeTracker) {
    buf.extend_from_slice(&(st.views.len() as u32).to_le_bytes());
    for v in &st.views {
        encode_view(buf, v);
    }
}

fn encode_arg(buf: &mut Vec<u8>, arg: &Arg) {
    match arg {
        Arg::None => buf.push(0),
        Arg::Device(d) => {
            buf.push(1);
            encode_str(buf, d);
        }
        Arg::Buffer { id, size } => {
            buf.push(2);
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&(*size as u64).to_le_bytes());
        }
        Arg::BufferView { size, offset } => {
            buf.push(3);
            buf.extend_from_slice(&(*size as u64).to_le_bytes());
            buf.extend_from_slice(&(*offset as u64).to_le_bytes());
        }
        Arg::Const(c) => {
            buf.push(4);
            match c {
                ConstValue::Float(v) => {
                    buf.push(0);
                    buf.extend_from_slice(&v.to_bits().to_le_bytes());
                }
                ConstValue::Int(v) => {
                    buf.push(1);
                    encode_i64(buf, *v);
                }
                ConstValue::Bool(v) => {
                    buf.push(2);
                    buf.push(*v as u8);
                }
            }
        }
        Arg::Var(v) => {
            buf.push(5);
            encode_sint(buf, &SInt::Var(v.clone()));
        }
        Arg::Global(i) => {
            buf.push(6);
            buf.extend_from_slice(&(*i as u64).to_le_bytes());
        }
        Arg::St(st) => {
            buf.push(7);
            encode_st(buf, st);
        }
        Arg::Shape(s) => {
            buf.push(8);
            encode_sints(buf, s);
        }
        Arg::Axes(a) => {
            buf.push(9);
            buf.extend_from_slice(&(a.len() as u32).to_le_bytes());
            for &x in a {
                buf.extend_from_slice(&(x as u32).to_le_bytes());
            }
        }
        Arg::Pairs(p) => {
            buf.push(10);
            buf.extend_from_slice(&(p.len() as u32).to_le_bytes());
            for (b, e) in p {
                encode_sint(buf, b);
                encode_sint(buf, e);
            }
        }
        Arg::Reduce { op, axes } => {
            buf.push(11);
            buf.push(*op as u8);
            buf.extend_from_slice(&(axes.len() as u32).to_le_bytes());
            for &x in axes {
                buf.extend_from_slice(&(x as u32).to_le_bytes());
            }
        }
        Arg::Info(info) => {
            buf.push(12);
            encode_str(buf, &info.name);
        }
        Arg::Kernel(_) => buf.push(13),
    }
}
