use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use crate::config::Settings;
use crate::db::Db;
use crate::keyring::Keyring;
use crate::mail::{Attachment, DirTemplates, FileTransport, Mailer, OutgoingMail};
use crate::registry::KeyRegistry;

#[derive(Parser)]
#[command(name = "mailseal")]
#[command(about = "OpenPGP key registry and PGP/MIME mail assembly")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate the service signing identity in the keystore
    Init {
        /// Identity for the signing key, e.g. "Service <mail@example.com>"
        identity: String,
    },
    /// Validate and store a recipient key
    Import {
        /// Path to an armored public key file
        file: PathBuf,
        /// Name encrypted attachments with an .asc extension for this key
        #[arg(long)]
        use_asc: bool,
    },
    /// Validate a key without storing it
    Validate {
        /// Path to an armored public key file
        file: PathBuf,
    },
    /// Preview the addresses a key certifies, without storing anything
    Addresses {
        /// Path to an armored public key file
        file: PathBuf,
    },
    /// List stored keys
    List {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Delete a stored key and purge its material
    Delete {
        /// Fingerprint of the key to delete
        fingerprint: String,
    },
    /// Send a message, encrypting per recipient where keys exist
    Send {
        /// Sender address
        #[arg(long)]
        from: String,
        /// Recipient addresses
        #[arg(long, required = true)]
        to: Vec<String>,
        /// Subject line
        #[arg(long)]
        subject: String,
        /// Literal body text
        #[arg(long)]
        body: Option<String>,
        /// Template name rendered as <name>.txt / <name>.html
        #[arg(long, conflicts_with = "body")]
        template: Option<String>,
        /// JSON object with template context values
        #[arg(long)]
        context: Option<String>,
        /// Files to attach
        #[arg(long)]
        attach: Vec<PathBuf>,
        /// Skip failing batches instead of aborting the send
        #[arg(long)]
        fail_silently: bool,
    },
}

pub struct CliApp {
    settings: Settings,
    keyring: Option<Arc<Keyring>>,
    registry: Option<KeyRegistry>,
    mailer: Mailer,
}

impl CliApp {
    pub async fn connect(settings: Settings) -> Result<Self> {
        let db = Arc::new(Db::open(&settings.db_path).await?);
        db.init().await?;
        let transport = Arc::new(FileTransport::new(&settings.outbox_dir));

        if settings.use_pgp {
            let keyring = Arc::new(Keyring::open(
                &settings.keystore_home,
                settings.always_trust,
            )?);
            let registry = KeyRegistry::new(db, keyring.clone());
            let mailer = Mailer::with_pgp(
                transport,
                keyring.clone(),
                registry.clone(),
                settings.sign_outgoing,
            );
            Ok(Self {
                settings,
                keyring: Some(keyring),
                registry: Some(registry),
                mailer,
            })
        } else {
            Ok(Self {
                settings,
                keyring: None,
                registry: None,
                mailer: Mailer::passthrough(transport),
            })
        }
    }

    fn registry(&self) -> Result<&KeyRegistry> {
        self.registry
            .as_ref()
            .ok_or_else(|| anyhow!("the OpenPGP backend is disabled (MAILSEAL_USE_PGP=0)"))
    }

    fn keyring(&self) -> Result<&Keyring> {
        self.keyring
            .as_deref()
            .ok_or_else(|| anyhow!("the OpenPGP backend is disabled (MAILSEAL_USE_PGP=0)"))
    }
}

pub async fn run_cli(cli: Cli, settings: Settings) -> Result<()> {
    let app = CliApp::connect(settings).await?;

    match cli.command {
        Commands::Init { identity } => {
            let fingerprint = app.keyring()?.generate_signing_key(&identity)?;
            println!("generated signing key {}", fingerprint);
        }

        Commands::Import { file, use_asc } => {
            let material = read_key_file(&file)?;
            let registry = app.registry()?;
            let row = registry.save(&material, use_asc).await?;
            println!("imported key {}", row.fingerprint);
            if let Some(addresses) = registry.read_addresses(&material)? {
                for address in addresses {
                    println!("  {}", address);
                }
            }
        }

        Commands::Validate { file } => {
            let material = read_key_file(&file)?;
            match app.registry()?.validate(&material) {
                Ok(fingerprint) => println!("valid key {}", fingerprint),
                Err(err) => {
                    println!("rejected: {}", err);
                    std::process::exit(1);
                }
            }
        }

        Commands::Addresses { file } => {
            let material = read_key_file(&file)?;
            match app.registry()?.read_addresses(&material)? {
                Some(addresses) => {
                    for address in addresses {
                        println!("{}", address);
                    }
                }
                None => {
                    println!("key did not validate");
                    std::process::exit(1);
                }
            }
        }

        Commands::List { json } => {
            let rows = app.registry()?.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!("{}  use_asc={}", row.fingerprint, row.use_asc);
                }
            }
        }

        Commands::Delete { fingerprint } => {
            let registry = app.registry()?;
            let rows = registry.list().await?;
            let row = rows
                .into_iter()
                .find(|row| row.fingerprint.eq_ignore_ascii_case(fingerprint.trim()))
                .ok_or_else(|| anyhow!("no stored key with fingerprint {}", fingerprint))?;
            registry.delete(&row).await?;
            println!("deleted {}", row.fingerprint);
        }

        Commands::Send {
            from,
            to,
            subject,
            body,
            template,
            context,
            attach,
            fail_silently,
        } => {
            let report = if let Some(template) = template {
                let template_dir = app
                    .settings
                    .template_dir
                    .clone()
                    .ok_or_else(|| anyhow!("MAILSEAL_TEMPLATE_DIR is not set"))?;
                let context: BTreeMap<String, String> = match context {
                    Some(raw) => serde_json::from_str(&raw).context("parsing --context JSON")?,
                    None => BTreeMap::new(),
                };
                app.mailer
                    .send_mail_template(
                        &subject,
                        &template,
                        &from,
                        &to,
                        &DirTemplates::new(template_dir),
                        &context,
                        fail_silently,
                    )
                    .await?
            } else {
                let mail = OutgoingMail {
                    subject,
                    from,
                    body_text: body
                        .ok_or_else(|| anyhow!("either --body or --template is required"))?,
                    body_html: None,
                    attachments: load_attachments(&attach)?,
                    headers: Vec::new(),
                };
                app.mailer.send_mail(&mail, &to, fail_silently).await?
            };
            info!(
                "send finished: {} delivered, {} skipped",
                report.delivered, report.skipped
            );
            println!(
                "delivered {} batch(es), skipped {}",
                report.delivered, report.skipped
            );
        }
    }

    Ok(())
}

fn read_key_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn load_attachments(paths: &[PathBuf]) -> Result<Vec<Attachment>> {
    paths
        .iter()
        .map(|path| {
            let data = std::fs::read(path)
                .with_context(|| format!("reading attachment {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("attachment")
                .to_string();
            Ok(Attachment {
                content_type: content_type_for(&filename).to_string(),
                filename,
                data,
            })
        })
        .collect()
}

fn content_type_for(filename: &str) -> &'static str {
    match filename
        .rsplit('.')
        .next()
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") | Some("asc") | Some("md") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}
