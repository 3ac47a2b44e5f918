//! File-transfer uploader.
//!
//! Uploads every event of a delivered batch through a `FileSink`. The daemon
//! uses `SpoolSink`, which mirrors uploads under `<spool>/<server>/`.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{Extension, ExtensionConfig};
use crate::capture::MotionEvent;
use crate::log::Logger;

pub const KIND: &str = "FtpUploader";
pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_SFTP_PORT: u16 = 22;

/// Remote file destination.
pub trait FileSink: Send {
    fn put(&mut self, endpoint: (&str, u16), user: Option<&str>, name: &str, data: &[u8]) -> Result<()>;
}

pub struct FtpUploader<S: FileSink> {
    sink: S,
    log: Logger,
}

impl<S: FileSink> FtpUploader<S> {
    pub fn new(sink: S, log: Logger) -> Self {
        Self { sink, log }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: FileSink> Extension for FtpUploader<S> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn deliver(&mut self, events: &[MotionEvent], _message: &str, config: &ExtensionConfig) -> Result<()> {
        let endpoint = config
            .endpoint()
            .ok_or_else(|| anyhow!("server or port not specified in configuration, skipping upload"))?;
        let remote_dir = config.get("directory");
        for event in events {
            let name = match remote_dir {
                Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), event.name()),
                None => event.name().to_string(),
            };
            self.sink
                .put(endpoint, config.user.as_deref(), &name, event.payload())
                .with_context(|| format!("upload of {} to {}:{} failed", name, endpoint.0, endpoint.1))?;
        }
        log::info!(
            target: self.log.target(),
            "uploaded {} file(s) to {}:{}",
            events.len(),
            endpoint.0,
            endpoint.1
        );
        Ok(())
    }
}

#[derive(Debug)]
pub struct SpoolSink {
    root: PathBuf,
}

impl SpoolSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSink for SpoolSink {
    fn put(&mut self, (server, _port): (&str, u16), _user: Option<&str>, name: &str, data: &[u8]) -> Result<()> {
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(anyhow!("refusing to upload outside the spool: {}", name));
        }
        let path = self.root.join(server).join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))
    }
}
