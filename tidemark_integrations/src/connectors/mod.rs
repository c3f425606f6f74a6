//! Source adapters implementing `tidemark_core::SourceAdapter`.

use sha2::{Digest, Sha256};

pub mod bluesky;
pub mod calendar;
pub mod github;
pub mod github_search;
pub mod linear;
pub mod location;
pub mod rss;

/// Hex SHA-256 over the NUL-separated parts, for upstreams without stable ids.
pub(crate) fn content_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_stable_sha256() {
        // sha256("abc")
        assert_eq!(
            content_id(&["abc"]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(content_id(&["ab", "c"]), content_id(&["ab", "c"]));
    }

    #[test]
    fn content_id_keeps_part_boundaries() {
        assert_ne!(content_id(&["ab", "c"]), content_id(&["a", "bc"]));
        assert_ne!(content_id(&["ab", "c"]), content_id(&["abc"]));
    }
}
