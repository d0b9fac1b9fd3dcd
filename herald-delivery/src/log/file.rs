use std::{collections::HashSet, io::SeekFrom, path::PathBuf};

use async_trait::async_trait;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::warn;

use super::{AttemptLog, AttemptOutcome, AttemptRecord};
use crate::{campaign::CampaignId, error::LogError, run::RunId};

/// JSON-lines attempt log; one record per line, appended in order.
///
/// Appends are serialised through a lock so concurrent workers never
/// interleave partial lines. A file left without a final newline (a torn
/// write) gets one before the first new record.
#[derive(Debug)]
pub struct FileAttemptLog {
    path: PathBuf,
    /// Held while appending; `true` once the file is known to end a line
    write_lock: Mutex<bool>,
}

impl FileAttemptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(false),
        }
    }

    #[must_use]
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<AttemptRecord>, LogError> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        let mut line_number = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            // A torn final line from a crash should not hide everything before it
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping unreadable line {line_number} in {}: {e}",
                    self.path.display()
                ),
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl AttemptLog for FileAttemptLog {
    async fn append(&self, record: &AttemptRecord) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut line_ended = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        if !*line_ended && !ends_line(&mut file).await? {
            line.insert(0, b'\n');
        }
        file.write_all(&line).await?;
        file.flush().await?;
        *line_ended = true;

        Ok(())
    }

    async fn run_records(&self, run_id: RunId) -> Result<Vec<AttemptRecord>, LogError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|record| record.run_id == run_id)
            .collect())
    }

    async fn delivered(&self, campaign_id: CampaignId) -> Result<HashSet<String>, LogError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.campaign_id == campaign_id && r.outcome == AttemptOutcome::Success)
            .map(|r| r.recipient)
            .collect())
    }
}

/// Whether `file` is empty or its last byte is a newline
async fn ends_line(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(true);
    }

    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}
