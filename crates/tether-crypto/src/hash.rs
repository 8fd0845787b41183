use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Short, log-safe key identifier: hex of the first 8 bytes of sha256(key).
pub fn fingerprint(key_bytes: &[u8]) -> String {
    hex::encode(&sha256(key_bytes)[..8])
}
