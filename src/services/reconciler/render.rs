use sha2::{Digest, Sha256};
use std::fmt::Write;
use uuid::Uuid;

use super::types::ActiveKey;

/// SHA-256 of the empty string: the checksum of a mapping whose last key
/// was just revoked. Still a deployable state — it clears the remote file.
pub const EMPTY_CONTENT_CHECKSUM: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone)]
pub struct RenderedAuthorizedKeys {
    pub content: String,
    pub checksum: String,
    pub key_count: usize,
    pub key_ids: Vec<Uuid>,
}

/// Render the desired authorized_keys bytes for a set of active keys.
///
/// Keys are sorted by fingerprint so the byte sequence is stable no matter
/// the insertion order. One line per key: `options key comment`, `\n`
/// terminated. Pure; callers recompute from current state on every run.
pub fn render_authorized_keys(keys: &[ActiveKey]) -> RenderedAuthorizedKeys {
    let mut sorted: Vec<&ActiveKey> = keys.iter().collect();
    sorted.sort_by(|a, b| a.fingerprint_sha256.cmp(&b.fingerprint_sha256));

    let mut content = String::new();
    let mut key_ids = Vec::with_capacity(sorted.len());
    for key in &sorted {
        if let Some(options) = key
            .authorized_keys_options
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            content.push_str(options);
            content.push(' ');
        }
        content.push_str(key.public_key.trim());
        if let Some(comment) = key
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            content.push(' ');
            content.push_str(comment);
        }
        content.push('\n');
        key_ids.push(key.id);
    }

    let checksum = sha256_hex(content.as_bytes());
    RenderedAuthorizedKeys {
        content,
        checksum,
        key_count: sorted.len(),
        key_ids,
    }
}

/// SHA-256 fingerprint of an OpenSSH public key line: lowercase hex over
/// the base64-decoded key blob. `None` when the line has no decodable blob.
pub fn key_fingerprint_sha256(public_key: &str) -> Option<String> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let blob = public_key.split_whitespace().nth(1)?;
    let bytes = STANDARD.decode(blob).ok()?;
    Some(sha256_hex(&bytes))
}

pub(super) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}
