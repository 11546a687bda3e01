use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub type RecordFn = Arc<dyn Fn(&[u8], u16, u32) + Send + Sync>;

/// Where received payloads go: a raw file (concatenated payloads, no
/// container) or a user callback.
#[derive(Clone)]
pub enum RecordTo {
    File(PathBuf),
    Callback(RecordFn),
}

impl RecordTo {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn callback<F: Fn(&[u8], u16, u32) + Send + Sync + 'static>(f: F) -> Self {
        Self::Callback(Arc::new(f))
    }
}

/// Materialized sink for one stream. The file is opened lazily on the first
/// write; an open failure is fatal to the session.
pub enum RecordSink {
    File { path: PathBuf, file: Option<File> },
    Callback(RecordFn),
}

impl RecordSink {
    pub fn new(config: &RecordTo) -> Self {
        match config {
            RecordTo::File(path) => Self::File {
                path: path.clone(),
                file: None,
            },
            RecordTo::Callback(f) => Self::Callback(f.clone()),
        }
    }

    pub fn write(&mut self, payload: &[u8], seq: u16, timestamp: u32) -> Result<()> {
        match self {
            Self::File { path, file } => {
                if file.is_none() {
                    let created = File::create(&path)
                        .with_context(|| format!("recorder: create {}", path.display()))?;
                    info!("recording to {}", path.display());
                    *file = Some(created);
                }
                if let Some(file) = file {
                    file.write_all(payload)
                        .with_context(|| format!("recorder: write {}", path.display()))?;
                }
                Ok(())
            }
            Self::Callback(f) => {
                f(payload, seq, timestamp);
                Ok(())
            }
        }
    }
}
