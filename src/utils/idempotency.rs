/// Idempotency key generation
use sha2::{Digest, Sha256};

pub fn generate_idempotency_key(components: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for component in components {
        hasher.update(component.as_bytes());
        hasher.update(b"|");
    }
    let result = hasher.finalize();
    format!("{:x}", result)
}
