//! E-mail notifier.
//!
//! Builds one message per delivery with every event attached and hands it to a
//! `MailTransport`. The relay itself is external; the daemon ships a spool
//! transport that writes each message to disk for a relay agent to pick up.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Extension, ExtensionConfig};
use crate::capture::MotionEvent;
use crate::log::Logger;

pub const KIND: &str = "SmtpNotifier";
pub const DEFAULT_SMTP_PORT: u16 = 25;
const SUBJECT: &str = "Motion detected";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: &'static str,
    #[serde(skip)]
    pub data: Arc<[u8]>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub server: String,
    pub port: u16,
    pub user: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl MailMessage {
    /// Build a message for a batch. `to` may hold several comma separated
    /// recipients.
    pub fn for_events(
        (server, port): (&str, u16),
        user: Option<&str>,
        from: &str,
        to: &str,
        message: &str,
        events: &[MotionEvent],
    ) -> Self {
        Self {
            server: server.to_string(),
            port,
            user: user.map(str::to_string),
            from: from.to_string(),
            to: to
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_string)
                .collect(),
            subject: SUBJECT.to_string(),
            body: message.to_string(),
            attachments: events
                .iter()
                .map(|event| Attachment {
                    file_name: event.name().to_string(),
                    content_type: content_type(event.name()),
                    data: Arc::from(event.payload()),
                })
                .collect(),
        }
    }
}

fn content_type(file_name: &str) -> &'static str {
    match Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

pub trait MailTransport: Send {
    fn send(&mut self, message: &MailMessage) -> Result<()>;
}

pub struct SmtpNotifier<T: MailTransport> {
    transport: T,
    log: Logger,
}

impl<T: MailTransport> SmtpNotifier<T> {
    pub fn new(transport: T, log: Logger) -> Self {
        Self { transport, log }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: MailTransport> Extension for SmtpNotifier<T> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn deliver(&mut self, events: &[MotionEvent], message: &str, config: &ExtensionConfig) -> Result<()> {
        let endpoint = config.endpoint().ok_or_else(|| {
            anyhow!("server or port not specified in configuration, skipping email notification")
        })?;
        let (from, to) = match (config.get("from"), config.get("to")) {
            (Some(from), Some(to)) => (from, to),
            _ => {
                return Err(anyhow!(
                    "no from or to email address specified, skipping email notification"
                ))
            }
        };
        if events.is_empty() {
            return Err(anyhow!("nothing to attach"));
        }

        let mail = MailMessage::for_events(endpoint, config.user.as_deref(), from, to, message, events);
        log::info!(
            target: self.log.target(),
            "sending email to {} with {} attachment(s)",
            to,
            mail.attachments.len()
        );
        self.transport.send(&mail)
    }
}

/// Writes each message into its own directory under `root`:
/// `message.json` with the envelope and one file per attachment.
#[derive(Debug)]
pub struct SpoolMailTransport {
    root: PathBuf,
    sequence: u64,
}

impl SpoolMailTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sequence: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MailTransport for SpoolMailTransport {
    fn send(&mut self, message: &MailMessage) -> Result<()> {
        self.sequence += 1;
        let stem = message
            .attachments
            .first()
            .and_then(|a| Path::new(&a.file_name).file_stem())
            .and_then(|stem| stem.to_str())
            .unwrap_or("message");
        let dir = self.root.join(format!("{:06}-{}", self.sequence, stem));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create mail spool {}", dir.display()))?;

        let envelope = serde_json::to_vec_pretty(message).context("failed to encode message")?;
        std::fs::write(dir.join("message.json"), envelope)
            .with_context(|| format!("failed to write message in {}", dir.display()))?;
        for attachment in &message.attachments {
            let path = dir.join(&attachment.file_name);
            std::fs::write(&path, &attachment.data)
                .with_context(|| format!("failed to write attachment {}", path.display()))?;
        }
        Ok(())
    }
}
