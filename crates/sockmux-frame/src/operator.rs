//! Operator names and their wire codes.
//!
//! An operator is identified on the wire by a 32-bit hash of its name. The
//! hash function itself is a black box to the protocol; both ends just have
//! to agree on it. CRC-32 (IEEE) is the default.

/// Maps an operator name to its 32-bit wire code.
pub trait OperatorHasher: Send + Sync {
    fn hash(&self, name: &str) -> u32;
}

/// CRC-32 (IEEE 802.3) operator hashing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32Hasher;

impl OperatorHasher for Crc32Hasher {
    fn hash(&self, name: &str) -> u32 {
        crc32fast::hash(name.as_bytes())
    }
}

impl<F> OperatorHasher for F
where
    F: Fn(&str) -> u32 + Send + Sync,
{
    fn hash(&self, name: &str) -> u32 {
        self(name)
    }
}

/// Wire code of `name` under the default hasher.
pub fn operator_code(name: &str) -> u32 {
    Crc32Hasher.hash(name)
}
