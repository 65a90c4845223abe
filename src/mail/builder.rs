//! PGP/MIME assembly for one recipient batch.
//!
//! The stages compose: plain tree, then an optional `multipart/signed`
//! wrapper, then an optional `multipart/encrypted` wrapper around whatever
//! came before. Sign-then-encrypt is the only layering produced.

use log::debug;

use super::mime::{self, Encoding, MimePart};
use crate::error::SendError;
use crate::keyring::{micalg, Keyring};
use crate::registry::KeyRegistry;

/// Which stages apply to the current batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildFlags {
    pub sign: bool,
    pub encrypt: bool,
}

/// An attachment as a name/type/bytes triple.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// The message content handed in by the caller, before any PGP stage.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMail {
    pub subject: String,
    pub from: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Extra top-level headers.
    pub headers: Vec<(String, String)>,
}

/// Assembles the wire-format MIME tree for one batch.
pub struct MessageBuilder<'a> {
    keyring: &'a Keyring,
    registry: &'a KeyRegistry,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(keyring: &'a Keyring, registry: &'a KeyRegistry) -> Self {
        Self { keyring, registry }
    }

    /// Produce the final tree for `batch`. With neither stage requested
    /// this is a passthrough of the plain tree.
    pub fn build(
        &self,
        mail: &OutgoingMail,
        batch: &[String],
        flags: BuildFlags,
    ) -> Result<MimePart, SendError> {
        let mut part = plain_tree(mail);
        if flags.sign {
            part = self.sign_stage(part)?;
        }
        if flags.encrypt {
            part = self.encrypt_stage(part, batch)?;
        }
        Ok(part)
    }

    /// Wrap `part` in `multipart/signed` with a detached signature over its
    /// canonical CRLF rendering.
    fn sign_stage(&self, part: MimePart) -> Result<MimePart, SendError> {
        let mut sign_text = mime::normalize_crlf(&part.render());
        if part.content_type().starts_with("multipart/") && !sign_text.ends_with("\r\n") {
            sign_text.push_str("\r\n");
        }
        let signature = self
            .keyring
            .sign_detached(sign_text.as_bytes())
            .map_err(|e| SendError::Signing(e.to_string()))?;
        debug!("signed {} bytes ({})", sign_text.len(), micalg(signature.hash));

        let signature_part = MimePart::leaf(
            "application/pgp-signature",
            vec![("name".to_string(), "signature.asc".to_string())],
            vec![
                (
                    "Content-Disposition".to_string(),
                    "attachment; filename=\"signature.asc\"".to_string(),
                ),
                (
                    "Content-Description".to_string(),
                    "Message signed with OpenPGP".to_string(),
                ),
            ],
            Encoding::SevenBit,
            signature.armored.into_bytes(),
        );
        Ok(MimePart::multipart(
            "signed",
            vec![
                (
                    "protocol".to_string(),
                    "application/pgp-signature".to_string(),
                ),
                ("micalg".to_string(), micalg(signature.hash).to_string()),
            ],
            vec![part, signature_part],
        ))
    }

    /// Encrypt `part` for every address in the batch and wrap the armored
    /// ciphertext in `multipart/encrypted`.
    fn encrypt_stage(&self, part: MimePart, batch: &[String]) -> Result<MimePart, SendError> {
        let mut fingerprints: Vec<String> = Vec::new();
        for address in batch {
            let matches = self
                .registry
                .fingerprints_for(address)
                .map_err(|e| SendError::Encryption(e.to_string()))?;
            if matches.is_empty() {
                return Err(SendError::NoKeyForAddress(address.clone()));
            }
            fingerprints.extend(matches);
        }
        fingerprints.sort();
        fingerprints.dedup();

        let payload = mime::normalize_crlf(&part.render());
        let outcome = self
            .keyring
            .encrypt(payload.as_bytes(), &fingerprints)
            .map_err(|e| SendError::Encryption(e.to_string()))?;
        if let Some(rejected) = outcome.invalid.first() {
            return Err(SendError::InvalidRecipient(rejected.clone()));
        }
        let ciphertext = outcome
            .armored
            .ok_or_else(|| SendError::Encryption("engine produced no ciphertext".to_string()))?;

        let version_part = MimePart::leaf(
            "application/pgp-encrypted",
            vec![],
            vec![(
                "Content-Description".to_string(),
                "PGP/MIME Versions Identification".to_string(),
            )],
            Encoding::SevenBit,
            b"Version: 1".to_vec(),
        );
        let body_part = MimePart::leaf(
            "application/octet-stream",
            vec![("name".to_string(), "encrypted.asc".to_string())],
            vec![
                (
                    "Content-Disposition".to_string(),
                    "inline; filename=\"encrypted.asc\"".to_string(),
                ),
                (
                    "Content-Description".to_string(),
                    "OpenPGP encrypted message".to_string(),
                ),
            ],
            Encoding::SevenBit,
            ciphertext.into_bytes(),
        );
        Ok(MimePart::multipart(
            "encrypted",
            vec![(
                "protocol".to_string(),
                "application/pgp-encrypted".to_string(),
            )],
            vec![version_part, body_part],
        )
        .with_preamble(
            "This is an OpenPGP/MIME encrypted message (RFC 2440 and 3156)",
        ))
    }
}

/// Build the plain tree: body text, optional HTML alternative, attachments.
pub(crate) fn plain_tree(mail: &OutgoingMail) -> MimePart {
    let mut body_text = mail.body_text.clone();
    if !mail.attachments.is_empty() {
        // keep a blank separator line between the body and what follows
        let normalized = body_text.replace("\r\n", "\n");
        if !normalized.ends_with("\n\n") {
            body_text.push_str("\n\n");
        }
    }

    let body = match &mail.body_html {
        Some(html) => MimePart::multipart(
            "alternative",
            vec![],
            vec![MimePart::text_plain(&body_text), MimePart::text_html(html)],
        ),
        None => MimePart::text_plain(&body_text),
    };

    if mail.attachments.is_empty() {
        return body;
    }
    let mut parts = vec![body];
    parts.extend(mail.attachments.iter().map(|attachment| {
        MimePart::attachment(
            &attachment.filename,
            &attachment.content_type,
            &attachment.data,
        )
    }));
    MimePart::multipart("mixed", vec![], parts)
}
