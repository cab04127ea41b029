//! Id / token generation.
//!
//! Tunnel askpass tokens and companion attach-session ids must be
//! unguessable and rotated on every spawn. Production uses `nanoid`;
//! tests use a fixed sequence so token-rotation assertions are exact.

use parking_lot::Mutex;
use std::sync::Arc;

const TOKEN_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
    'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z',
];

/// Generates opaque identifiers (tokens, attach-session ids).
pub trait IdGen: Clone + Send + Sync + 'static {
    fn next_id(&self) -> String;
}

/// Production id generator backed by `nanoid`.
#[derive(Clone, Default)]
pub struct NanoIdGen;

impl IdGen for NanoIdGen {
    fn next_id(&self) -> String {
        nanoid::nanoid!(32, &TOKEN_ALPHABET)
    }
}

/// Deterministic id generator for tests: returns `prefix-0`, `prefix-1`, ...
#[derive(Clone)]
pub struct FixedIdGen {
    prefix: String,
    counter: Arc<Mutex<u64>>,
}

impl FixedIdGen {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), counter: Arc::new(Mutex::new(0)) }
    }
}

impl IdGen for FixedIdGen {
    fn next_id(&self) -> String {
        let mut counter = self.counter.lock();
        let id = format!("{}-{}", self.prefix, *counter);
        *counter += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_id_gen_increments() {
        let gen = FixedIdGen::new("tok");
        assert_eq!(gen.next_id(), "tok-0");
        assert_eq!(gen.next_id(), "tok-1");
    }

    #[test]
    fn nanoid_gen_produces_distinct_tokens() {
        let gen = NanoIdGen;
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
