use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{AuditSink, ExecutionRecord};
use crate::{Error, Result};

/// Append-only file with one JSON record per line.
///
/// The file is opened in append mode for every record, so an external
/// rotation (rename + new file) is picked up without a restart.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn init(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::Audit(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        info!("Audit log: {}", self.path.display());
        Ok(())
    }

    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        read_tail(&self.path, limit, TAIL_CHUNK).await
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

const TAIL_CHUNK: u64 = 64 * 1024;

/// Newest `limit` records, reading the file backwards in `chunk_size` blocks
/// so the cost follows `limit` and not the size of the log.
async fn read_tail(path: &Path, limit: usize, chunk_size: u64) -> Result<Vec<ExecutionRecord>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut pos = file.metadata().await?.len();
    let mut records = Vec::new();
    // start of a line whose beginning lies in an earlier block
    let mut carry: Vec<u8> = Vec::new();

    while pos > 0 && records.len() < limit {
        let len = chunk_size.min(pos);
        pos -= len;

        let mut buf = vec![0u8; len as usize];
        file.seek(SeekFrom::Start(pos)).await?;
        file.read_exact(&mut buf).await?;
        buf.extend_from_slice(&carry);

        // bytes before the first newline may continue further back
        let complete = if pos == 0 {
            0
        } else {
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => i + 1,
                None => {
                    carry = buf;
                    continue;
                }
            }
        };

        for line in buf[complete..].split(|&b| b == b'\n').rev() {
            if records.len() == limit {
                break;
            }
            if let Some(record) = parse_line(line) {
                records.push(record);
            }
        }

        buf.truncate(complete);
        carry = buf;
    }

    Ok(records)
}

fn parse_line(line: &[u8]) -> Option<ExecutionRecord> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!("Skipping unparseable audit line: {}", e);
            None
        }
    }
}
