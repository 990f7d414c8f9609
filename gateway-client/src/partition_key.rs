use std::hash::Hasher;

use common_routing::Range;
use siphasher::sip128::{Hasher128, SipHasher24};

/// Maps a partition key value to its effective partition key: 32 uppercase hex digits.
///
/// The value's JSON form is hashed with SipHash-2-4 (128 bit). The two top bits are cleared so
/// every effective key sorts below `FF`, the exclusive end of the key space.
pub fn effective_partition_key(value: &serde_json::Value) -> String {
    let mut hasher = SipHasher24::new_with_keys(0, 0);
    hasher.write(value.to_string().as_bytes());
    let hash = hasher.finish128();

    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&hash.h1.to_be_bytes());
    bytes[8..].copy_from_slice(&hash.h2.to_be_bytes());
    bytes[0] &= 0x3F;

    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// The single-key range a partition key value routes to.
pub fn partition_key_range(value: &serde_json::Value) -> Range {
    Range::point(&effective_partition_key(value))
}

/// Value of the `x-ms-documentdb-partitionkey` header: a JSON array holding the key.
pub fn partition_key_header(value: &serde_json::Value) -> String {
    serde_json::Value::Array(vec![value.clone()]).to_string()
}
