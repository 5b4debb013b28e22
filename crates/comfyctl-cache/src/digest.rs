use std::hash::{Hash, Hasher};

use seahash::SeaHasher;

/// Compute a hex string hash of a hashable object.
///
/// The value is stable across releases and platforms; it keys cache
/// directories, so changing it would orphan existing entries.
pub fn hash_digest<H: Hash>(hashable: &H) -> String {
    fn hash_u64<H: Hash>(hashable: &H) -> u64 {
        let mut hasher = SeaHasher::new();
        hashable.hash(&mut hasher);
        hasher.finish()
    }

    hex::encode(hash_u64(hashable).to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::hash_digest;

    #[test]
    fn digest_is_stable() {
        assert_eq!(
            hash_digest(&"https://github.com/comfyanonymous/ComfyUI"),
            hash_digest(&"https://github.com/comfyanonymous/ComfyUI"),
        );
        assert_ne!(
            hash_digest(&"https://github.com/comfyanonymous/ComfyUI"),
            hash_digest(&"https://github.com/ltdrdata/ComfyUI-Manager"),
        );
    }
}
