//! Normalization of pasted key material and OpenPGP naming helpers.

use pgp::crypto::hash::HashAlgorithm;

use crate::error::ValidationError;

// Characters PGP tolerates around armor markers but the engine rejects.
// Same set the reference GPG tooling strips before import.
const ARMOR_JUNK: &str = r#"~!@#$%^&*()_+`-={}|[]\;':"<>?,./- "#;

fn is_armor_junk(c: char) -> bool {
    ARMOR_JUNK.contains(c)
}

/// Strip incidental characters preceding `-----BEGIN/END PGP` markers.
///
/// Key blocks arrive from webmail and chat clients with quoting artifacts
/// glued onto the armor lines; the encoded body itself is untouched. Input
/// that is not plain ASCII is rejected as [`ValidationError::BadEncoding`].
pub fn clean_key(material: &str) -> Result<String, ValidationError> {
    if !material.is_ascii() {
        return Err(ValidationError::BadEncoding);
    }
    let material = material.trim();

    let mut marker_starts: Vec<usize> = Vec::new();
    for marker in ["-----BEGIN PGP", "-----END PGP"] {
        let mut from = 0;
        while let Some(pos) = material[from..].find(marker) {
            marker_starts.push(from + pos);
            from += pos + marker.len();
        }
    }
    marker_starts.sort_unstable();
    marker_starts.dedup();

    let mut out = String::with_capacity(material.len());
    let mut prev = 0;
    for &start in &marker_starts {
        out.push_str(material[prev..start].trim_end_matches(is_armor_junk));
        prev = start;
    }
    out.push_str(&material[prev..]);
    Ok(out)
}

/// RFC 3156 `micalg` value for a hash algorithm: lower-case, hyphenated,
/// prefixed with `pgp-`.
pub fn micalg(alg: HashAlgorithm) -> &'static str {
    match alg {
        HashAlgorithm::MD5 => "pgp-md5",
        HashAlgorithm::SHA1 => "pgp-sha1",
        HashAlgorithm::RIPEMD160 => "pgp-ripemd160",
        HashAlgorithm::SHA2_256 => "pgp-sha256",
        HashAlgorithm::SHA2_384 => "pgp-sha384",
        HashAlgorithm::SHA2_512 => "pgp-sha512",
        HashAlgorithm::SHA2_224 => "pgp-sha224",
        HashAlgorithm::SHA3_256 => "pgp-sha3-256",
        HashAlgorithm::SHA3_512 => "pgp-sha3-512",
        _ => "pgp-sha256",
    }
}

/// Extract the bare email address from an OpenPGP user id like
/// `Alice Example <alice@example.com>`.
pub fn email_from_uid(uid: &str) -> Option<String> {
    let tail = uid.rsplit('<').next().unwrap_or(uid);
    let addr = tail.trim_end_matches('>').trim();
    if addr.contains('@') && !addr.contains(char::is_whitespace) {
        Some(addr.to_ascii_lowercase())
    } else {
        None
    }
}
