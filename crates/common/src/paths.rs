//! On-disk layout under the user's home directory.
//!
//! Everything the client persists lives below `${HOME}/xyz-jphil/ccapis/`:
//! the credentials document and the per-account OAuth token files.

use std::path::PathBuf;

/// Root data directory: `${HOME}/xyz-jphil/ccapis`.
pub fn data_dir() -> PathBuf {
    home_dir().join("xyz-jphil").join("ccapis")
}

/// Default credentials document path: `<data_dir>/CCAPIsCredentials.xml`.
pub fn credentials_file() -> PathBuf {
    data_dir().join("CCAPIsCredentials.xml")
}

/// Directory holding `<id>.tokens.json` files: `<data_dir>/oauth-tokens`.
pub fn token_dir() -> PathBuf {
    data_dir().join("oauth-tokens")
}

/// The user's home directory, falling back to the current directory when
/// neither `HOME` nor `USERPROFILE` is set.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_file_is_under_data_dir() {
        let path = credentials_file();
        assert!(path.starts_with(data_dir()));
        assert!(path.ends_with("CCAPIsCredentials.xml"));
    }

    #[test]
    fn token_dir_is_under_data_dir() {
        let dir = token_dir();
        assert!(dir.starts_with(data_dir()));
        assert!(dir.ends_with("oauth-tokens"));
    }

    #[test]
    fn data_dir_uses_vendor_prefix() {
        let dir = data_dir();
        let rendered = dir.to_string_lossy();
        assert!(rendered.contains("xyz-jphil"));
        assert!(rendered.ends_with("ccapis"));
    }
}
