//! UI assets embedded into the binary.
//!
//! The setup page itself is developed out of tree and dropped into `ui/`
//! at build time; this module only hands the bytes to the web layer.

use rust_embed::RustEmbed;
use std::borrow::Cow;

#[derive(RustEmbed)]
#[folder = "ui/"]
struct Asset;

/// Look up an embedded asset, returning its bytes and MIME type.
pub fn get_asset(path: &str) -> Option<(Cow<'static, [u8]>, String)> {
    let path = path.trim_start_matches('/');
    let asset = Asset::get(path)?;
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();
    Some((asset.data, mime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_setup_page_is_embedded() {
        let (data, mime) = get_asset("index.html").expect("index.html must be embedded");
        assert!(!data.is_empty());
        assert_eq!(mime, "text/html");
    }

    #[test]
    fn leading_slashes_are_tolerated() {
        assert!(get_asset("/index.html").is_some());
        assert!(get_asset("missing.css").is_none());
    }
}
