//! Pure string/URL helpers shared by the migration engine and the solver.

use sha2::{Digest, Sha256};

/// Strips everything from the first `#` onward. Idempotent: running it twice
/// is the same as running it once, and the result never contains `#`.
pub fn strip_fragment(url: &str) -> &str {
    match url.find('#') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Lowercase hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)
}

/// Strips HTML tags from `input`, leaving only text content concatenated in
/// document order. Exposed for the (out-of-scope) readable-content extraction
/// pipeline that populates `entries.readable_content`; kept here alongside
/// the other pure string utilities per spec.md §2's "URL/String Utilities"
/// component rather than duplicated in a feed-parsing module.
pub fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Derives the content hash for an entry per the §3 invariant:
/// URL wins if present; else title+content; else a legacy-id fallback that
/// forces a singleton (never collides with a real URL or content hash).
pub fn derive_entry_hash(id: i64, url: Option<&str>, title: Option<&str>, content: Option<&str>) -> String {
    if let Some(url) = url.map(str::trim).filter(|s| !s.is_empty()) {
        return sha256_hex(url);
    }
    let title = title.unwrap_or("");
    let content = content.unwrap_or("");
    if !title.trim().is_empty() || !content.trim().is_empty() {
        return sha256_hex(&format!("{title}{content}"));
    }
    sha256_hex(&format!("legacy-entry-id:{id}"))
}
