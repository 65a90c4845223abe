//! Full-pipeline test: import a recipient key, send to a mixed recipient
//! list, and check what reaches the transport.

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use crate::db::Db;
use crate::keyring::Keyring;
use crate::mail::{Mailer, MemoryTransport, OutgoingMail};
use crate::registry::KeyRegistry;

struct Pipeline {
    _home: TempDir,
    keyring: Arc<Keyring>,
    registry: KeyRegistry,
    transport: Arc<MemoryTransport>,
    mailer: Mailer,
}

async fn pipeline(sign: bool) -> Result<Pipeline> {
    let home = TempDir::new()?;
    let db = Arc::new(Db::open(":memory:").await?);
    db.init().await?;
    let keyring = Arc::new(Keyring::open(home.path(), true)?);
    let registry = KeyRegistry::new(db, keyring.clone());
    let transport = Arc::new(MemoryTransport::default());
    let mailer = Mailer::with_pgp(transport.clone(), keyring.clone(), registry.clone(), sign);
    Ok(Pipeline {
        _home: home,
        keyring,
        registry,
        transport,
        mailer,
    })
}

#[tokio::test]
async fn test_mixed_send_end_to_end() -> Result<()> {
    let pipe = pipeline(true).await?;

    // service signing identity, generated straight into the primary
    // keystore so its secret half is available for the decrypt check
    pipe.keyring
        .generate_signing_key("Service <service@example.com>")?;

    // recipient key lives in the same keystore for the same reason
    let fpr = pipe
        .keyring
        .generate_signing_key("Alice <alice@example.com>")?;
    let armored = std::fs::read_to_string(pipe.keyring.home().join(format!("{}.asc", fpr)))?;
    let row = pipe.registry.save(&armored, false).await?;
    assert_eq!(row.fingerprint, fpr);
    assert_eq!(
        pipe.registry
            .lookup("alice@example.com")
            .await?
            .map(|r| r.id),
        Some(row.id)
    );

    let mail = OutgoingMail {
        subject: "status".to_string(),
        from: "service@example.com".to_string(),
        body_text: "quarterly numbers attached".to_string(),
        ..Default::default()
    };
    let report = pipe
        .mailer
        .send_mail(
            &mail,
            &[
                "alice@example.com".to_string(),
                "carol@example.com".to_string(),
            ],
            false,
        )
        .await?;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.skipped, 0);

    let sent = pipe.transport.sent();
    assert_eq!(sent.len(), 2);

    // carol has no key: one plain batch, signed but not encrypted
    let plain = &sent[0];
    assert_eq!(plain.recipients, vec!["carol@example.com".to_string()]);
    assert!(plain.message.contains("Content-Type: multipart/signed"));
    assert!(!plain.message.contains("multipart/encrypted"));

    // alice gets her own encrypted singleton
    let sealed = &sent[1];
    assert_eq!(sealed.recipients, vec!["alice@example.com".to_string()]);
    assert!(sealed.message.contains("Content-Type: multipart/encrypted"));
    assert!(sealed.message.contains("Version: 1"));
    assert!(!sealed.message.contains("quarterly numbers"));

    // sign-then-encrypt layering: the decrypted payload is the signed tree
    let armor_start = sealed
        .message
        .find("-----BEGIN PGP MESSAGE-----")
        .expect("armored ciphertext present");
    let armor_end = sealed
        .message
        .find("-----END PGP MESSAGE-----")
        .expect("armor terminator present")
        + "-----END PGP MESSAGE-----".len();
    let decrypted = pipe
        .keyring
        .decrypt(&sealed.message[armor_start..armor_end])?;
    let decrypted = String::from_utf8(decrypted)?;
    assert!(decrypted.starts_with("Content-Type: multipart/signed"));
    assert!(decrypted.contains("quarterly numbers"));
    Ok(())
}

#[tokio::test]
async fn test_unsigned_send_stays_plain_for_keyless_recipients() -> Result<()> {
    let pipe = pipeline(false).await?;
    let mail = OutgoingMail {
        subject: "plain".to_string(),
        from: "service@example.com".to_string(),
        body_text: "nothing secret".to_string(),
        ..Default::default()
    };
    pipe.mailer
        .send_mail(&mail, &["carol@example.com".to_string()], false)
        .await?;
    let sent = pipe.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].message.contains("Content-Type: text/plain"));
    assert!(sent[0].message.contains("nothing secret"));
    Ok(())
}
