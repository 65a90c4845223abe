//! Outgoing mail pipeline: MIME model, PGP/MIME assembly, recipient
//! partitioning, send orchestration, and the transport/template boundaries.

pub mod builder;
pub mod mime;
pub mod partition;
pub mod send;
pub mod template;

pub use builder::{Attachment, BuildFlags, MessageBuilder, OutgoingMail};
pub use mime::MimePart;
pub use partition::{partition, Batches};
pub use send::{FileTransport, MailTransport, Mailer, MemoryTransport, SendReport, SentMail};
pub use template::{DirTemplates, TemplateRenderer};
