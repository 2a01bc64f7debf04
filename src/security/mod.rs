pub mod filenames;

use sha2::{Digest, Sha256};
use std::path::Path;

/// Stable, non-reversible token used wherever a path would otherwise be logged.
pub fn hash_path(p: &Path) -> String {
    let mut h = Sha256::new();
    h.update(p.as_os_str().to_string_lossy().as_bytes());
    format!("{:x}", h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_and_hides_path() {
        let hashed = hash_path(Path::new("/home/alice/.local/share/com.codictate.app"));
        assert_eq!(hashed.len(), 64);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!hashed.contains("alice"));
    }
}
