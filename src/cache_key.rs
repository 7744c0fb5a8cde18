use md5::{Digest, Md5};
use std::path::{Path, PathBuf};

/// Maps a source URL to the name of its cache file.
///
/// The digest covers the exact URL string with no normalization, so two URLs that differ only in
/// query parameter order are two separate entries.
pub fn derive(url: &str) -> String {
    let digest = Md5::digest(url.as_bytes());
    format!("{digest:x}")
}

pub fn cache_path(cache_directory: &Path, url: &str) -> PathBuf {
    cache_directory.join(derive(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_lowercase_md5_hex() {
        assert_eq!(derive("abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(derive("abc").len(), 32);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let url = "https://cdn.example.com/img/cat.png?size=large";
        assert_eq!(derive(url), derive(url));
    }

    #[test]
    fn test_query_order_is_significant() {
        assert_ne!(
            derive("https://cdn.example.com/a.png?w=1&h=2"),
            derive("https://cdn.example.com/a.png?h=2&w=1")
        );
    }

    #[test]
    fn test_cache_path_joins_key() {
        let path = cache_path(Path::new("/var/cache/media"), "abc");
        assert_eq!(
            path,
            PathBuf::from("/var/cache/media/900150983cd24fb0d6963f7d28e17f72")
        );
    }
}
