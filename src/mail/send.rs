//! Send orchestration: partition recipients, build each batch, hand the
//! rendered message to the transport collaborator.
//!
//! Fail-silently is scoped per batch: a batch whose signing or encryption
//! fails is skipped whole, never delivered degraded. A recipient that was
//! supposed to be encrypted but has no key aborts the send in every mode.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{info, warn};

use super::builder::{plain_tree, BuildFlags, MessageBuilder, OutgoingMail};
use super::mime::{render_message, MimePart};
use super::partition::partition;
use super::template::TemplateRenderer;
use crate::config::Settings;
use crate::db::Db;
use crate::error::SendError;
use crate::keyring::Keyring;
use crate::registry::KeyRegistry;

/// Delivery collaborator. Receives fully formed MIME bytes; connection
/// management stays on its side of the boundary.
pub trait MailTransport: Send + Sync {
    fn deliver(&self, from: &str, recipients: &[String], message: &str)
        -> Result<(), SendError>;
}

/// What happened to the batches of one send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub delivered: usize,
    pub skipped: usize,
}

struct PgpContext {
    keyring: Arc<Keyring>,
    registry: KeyRegistry,
    sign: bool,
}

/// Drives partitioning, assembly, and dispatch.
pub struct Mailer {
    transport: Arc<dyn MailTransport>,
    pgp: Option<PgpContext>,
}

impl Mailer {
    /// A mailer with the OpenPGP stages disabled: every send is a single
    /// plain batch. The builder and partitioner are never consulted.
    pub fn passthrough(transport: Arc<dyn MailTransport>) -> Self {
        Self {
            transport,
            pgp: None,
        }
    }

    /// A mailer over an opened keystore and registry.
    pub fn with_pgp(
        transport: Arc<dyn MailTransport>,
        keyring: Arc<Keyring>,
        registry: KeyRegistry,
        sign: bool,
    ) -> Self {
        Self {
            transport,
            pgp: Some(PgpContext {
                keyring,
                registry,
                sign,
            }),
        }
    }

    /// Build a mailer from settings: the backend feature flag decides at
    /// construction time whether this is a passthrough.
    pub fn from_settings(
        settings: &Settings,
        db: Arc<Db>,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self> {
        if !settings.use_pgp {
            return Ok(Self::passthrough(transport));
        }
        let keyring = Arc::new(Keyring::open(
            &settings.keystore_home,
            settings.always_trust,
        )?);
        let registry = KeyRegistry::new(db, keyring.clone());
        Ok(Self::with_pgp(
            transport,
            keyring,
            registry,
            settings.sign_outgoing,
        ))
    }

    /// The registry, when the OpenPGP backend is enabled.
    pub fn registry(&self) -> Option<&KeyRegistry> {
        self.pgp.as_ref().map(|ctx| &ctx.registry)
    }

    /// Send to `recipients`, encrypting per recipient where a usable key
    /// exists and signing when configured.
    pub async fn send_mail(
        &self,
        mail: &OutgoingMail,
        recipients: &[String],
        fail_silently: bool,
    ) -> Result<SendReport> {
        let mut report = SendReport::default();
        if recipients.is_empty() {
            return Ok(report);
        }
        let Some(ctx) = &self.pgp else {
            let tree = plain_tree(mail);
            self.dispatch(mail, recipients, &tree, fail_silently, &mut report)?;
            return Ok(report);
        };

        let batches = partition(&ctx.registry, recipients).await?;
        if batches.is_empty() {
            return Ok(report);
        }
        let builder = MessageBuilder::new(&ctx.keyring, &ctx.registry);
        for (batch, encrypt) in batches.dispatch_order() {
            let flags = BuildFlags {
                sign: ctx.sign,
                encrypt,
            };
            match builder.build(mail, &batch, flags) {
                Ok(tree) => {
                    self.dispatch(mail, &batch, &tree, fail_silently, &mut report)?
                }
                Err(err) => skip_or_raise(err, fail_silently, &mut report)?,
            }
        }
        info!(
            "send complete: {} delivered, {} skipped",
            report.delivered, report.skipped
        );
        Ok(report)
    }

    /// Render the two-template pair and send the result.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_mail_template(
        &self,
        subject: &str,
        template: &str,
        from: &str,
        recipients: &[String],
        renderer: &dyn TemplateRenderer,
        context: &BTreeMap<String, String>,
        fail_silently: bool,
    ) -> Result<SendReport> {
        let body_text = renderer
            .render(template, "txt", context)?
            .ok_or_else(|| anyhow!("missing template {}.txt", template))?;
        let body_html = renderer.render(template, "html", context)?;
        let mail = OutgoingMail {
            subject: subject.to_string(),
            from: from.to_string(),
            body_text,
            body_html,
            ..Default::default()
        };
        self.send_mail(&mail, recipients, fail_silently).await
    }

    fn dispatch(
        &self,
        mail: &OutgoingMail,
        batch: &[String],
        tree: &MimePart,
        fail_silently: bool,
        report: &mut SendReport,
    ) -> Result<()> {
        let rendered = render_full(mail, batch, tree);
        match self.transport.deliver(&mail.from, batch, &rendered) {
            Ok(()) => {
                report.delivered += 1;
                Ok(())
            }
            Err(err) => skip_or_raise(err, fail_silently, report),
        }
    }
}

fn skip_or_raise(err: SendError, fail_silently: bool, report: &mut SendReport) -> Result<()> {
    if fail_silently && err.suppressible() {
        warn!("skipping batch: {}", err);
        report.skipped += 1;
        Ok(())
    } else {
        Err(err.into())
    }
}

/// Render the complete RFC 822 message for a batch.
fn render_full(mail: &OutgoingMail, batch: &[String], tree: &MimePart) -> String {
    let mut headers: Vec<(String, String)> = vec![
        ("From".to_string(), mail.from.clone()),
        ("To".to_string(), batch.join(", ")),
        ("Subject".to_string(), mail.subject.clone()),
        ("Date".to_string(), Utc::now().to_rfc2822()),
    ];
    headers.extend(mail.headers.iter().cloned());
    render_message(&headers, tree)
}

/// Development transport: each message becomes a file in the outbox
/// directory.
pub struct FileTransport {
    dir: PathBuf,
    counter: AtomicU64,
}

impl FileTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl MailTransport for FileTransport {
    fn deliver(
        &self,
        _from: &str,
        _recipients: &[String],
        message: &str,
    ) -> Result<(), SendError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}.eml", Utc::now().format("%Y%m%d%H%M%S%f"), n);
        fs::create_dir_all(&self.dir)
            .and_then(|_| fs::write(self.dir.join(&name), message))
            .map_err(|e| SendError::Transport(e.to_string()))?;
        info!("wrote {}", self.dir.join(&name).display());
        Ok(())
    }
}

/// Recording transport for tests.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<SentMail>>,
}

/// One captured delivery.
#[derive(Debug, Clone)]
pub struct SentMail {
    pub from: String,
    pub recipients: Vec<String>,
    pub message: String,
}

impl MemoryTransport {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().expect("transport lock poisoned").clone()
    }
}

impl MailTransport for MemoryTransport {
    fn deliver(
        &self,
        from: &str,
        recipients: &[String],
        message: &str,
    ) -> Result<(), SendError> {
        self.sent
            .lock()
            .map_err(|_| SendError::Transport("transport lock poisoned".to_string()))?
            .push(SentMail {
                from: from.to_string(),
                recipients: recipients.to_vec(),
                message: message.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgp::composed::{Deserializable, SignedPublicKey};
    use tempfile::TempDir;

    struct Fixture {
        _home: TempDir,
        db: Arc<Db>,
        keyring: Arc<Keyring>,
        registry: KeyRegistry,
        transport: Arc<MemoryTransport>,
    }

    async fn fixture(always_trust: bool) -> Result<Fixture> {
        let home = TempDir::new()?;
        let db = Arc::new(Db::open(":memory:").await?);
        db.init().await?;
        let keyring = Arc::new(Keyring::open(home.path(), always_trust)?);
        let registry = KeyRegistry::new(db.clone(), keyring.clone());
        Ok(Fixture {
            _home: home,
            db,
            keyring,
            registry,
            transport: Arc::new(MemoryTransport::default()),
        })
    }

    fn mailer(fx: &Fixture, sign: bool) -> Mailer {
        Mailer::with_pgp(
            fx.transport.clone(),
            fx.keyring.clone(),
            fx.registry.clone(),
            sign,
        )
    }

    fn sample_mail() -> OutgoingMail {
        OutgoingMail {
            subject: "hello".to_string(),
            from: "sender@example.com".to_string(),
            body_text: "body text".to_string(),
            ..Default::default()
        }
    }

    fn armored_key_for(identity: &str) -> Result<String> {
        let scratch = Keyring::ephemeral()?;
        let fpr = scratch.generate_signing_key(identity)?;
        Ok(std::fs::read_to_string(
            scratch.home().join(format!("{}.asc", fpr)),
        )?)
    }

    #[tokio::test]
    async fn test_plain_and_encrypted_batches_split() -> Result<()> {
        let fx = fixture(true).await?;
        let armored = armored_key_for("Alice <alice@example.com>")?;
        fx.registry.save(&armored, false).await?;

        let mailer = mailer(&fx, false);
        let report = mailer
            .send_mail(
                &sample_mail(),
                &[
                    "alice@example.com".to_string(),
                    "carol@example.com".to_string(),
                ],
                false,
            )
            .await?;
        assert_eq!(report, SendReport { delivered: 2, skipped: 0 });

        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 2);
        // plain batch goes out first, then the encrypted singleton
        assert_eq!(sent[0].recipients, vec!["carol@example.com".to_string()]);
        assert!(sent[0].message.contains("Content-Type: text/plain"));
        assert_eq!(sent[1].recipients, vec!["alice@example.com".to_string()]);
        assert!(sent[1]
            .message
            .contains("Content-Type: multipart/encrypted"));
        Ok(())
    }

    #[tokio::test]
    async fn test_passthrough_mailer_never_encrypts() -> Result<()> {
        let fx = fixture(true).await?;
        let mailer = Mailer::passthrough(fx.transport.clone());
        let report = mailer
            .send_mail(&sample_mail(), &["anyone@example.com".to_string()], false)
            .await?;
        assert_eq!(report.delivered, 1);
        let sent = fx.transport.sent();
        assert!(sent[0].message.contains("Content-Type: text/plain"));
        assert!(!sent[0].message.contains("multipart/encrypted"));
        Ok(())
    }

    /// A stored key that parses but fails self-signature verification:
    /// its user certifications are grafted from an unrelated key.
    async fn plant_tampered_key(fx: &Fixture, address: &str) -> Result<String> {
        let victim = armored_key_for(&format!("V <{}>", address))?;
        let donor = armored_key_for("Donor <donor@example.com>")?;
        let (mut key, _) = SignedPublicKey::from_string(&victim)?;
        let (other, _) = SignedPublicKey::from_string(&donor)?;
        key.details.users = other.details.users;
        use pgp::types::KeyTrait;
        let fpr = hex::encode_upper(key.fingerprint());
        std::fs::write(
            fx.keyring.home().join(format!("{}.asc", fpr)),
            key.to_armored_string(None)?,
        )?;
        let row = fx.db.upsert_key(&fpr, "tampered", false).await?;
        fx.db.upsert_address(row.id, address, false).await?;
        Ok(fpr)
    }

    #[tokio::test]
    async fn test_fail_silently_skips_batch_without_dispatch() -> Result<()> {
        let fx = fixture(false).await?;
        plant_tampered_key(&fx, "donor@example.com").await?;

        let mailer = mailer(&fx, false);
        let report = mailer
            .send_mail(&sample_mail(), &["donor@example.com".to_string()], true)
            .await?;
        assert_eq!(report, SendReport { delivered: 0, skipped: 1 });
        assert!(fx.transport.sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_encryption_failure_raises_without_fail_silently() -> Result<()> {
        let fx = fixture(false).await?;
        plant_tampered_key(&fx, "donor@example.com").await?;

        let mailer = mailer(&fx, false);
        let err = mailer
            .send_mail(&sample_mail(), &["donor@example.com".to_string()], false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SendError>(),
            Some(SendError::InvalidRecipient(_))
        ));
        assert!(fx.transport.sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_template_send_renders_both_bodies() -> Result<()> {
        use super::super::template::DirTemplates;
        let fx = fixture(true).await?;
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("hello.txt"), "Hi {{ name }}")?;
        std::fs::write(dir.path().join("hello.html"), "<i>Hi {{ name }}</i>")?;

        let mailer = mailer(&fx, false);
        let mut context = BTreeMap::new();
        context.insert("name".to_string(), "Ada".to_string());
        mailer
            .send_mail_template(
                "templated",
                "hello",
                "sender@example.com",
                &["carol@example.com".to_string()],
                &DirTemplates::new(dir.path()),
                &context,
                false,
            )
            .await?;

        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].message.contains("multipart/alternative"));
        assert!(sent[0].message.contains("Hi Ada"));
        assert!(sent[0].message.contains("text/html"));
        Ok(())
    }
}
