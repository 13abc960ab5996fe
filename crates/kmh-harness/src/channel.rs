//! File-backed request/response channel between supervisor and worker.
//!
//! Each message is a JSON envelope carrying a schema version, the job id and
//! a send timestamp around the payload. Writes go through a temporary sibling
//! and a rename so the receiving side never parses half a message.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kmh_types::ChannelError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub schema_version: String,
    pub job_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(schema_version: &str, job_id: Uuid, payload: T) -> Self {
        Self {
            schema_version: schema_version.to_string(),
            job_id,
            sent_at: Utc::now(),
            payload,
        }
    }
}

/// One end of a file channel. The same path is written once by the sender
/// and read once by the receiver.
#[derive(Debug, Clone)]
pub struct FileChannel {
    path: PathBuf,
    timeout: Duration,
}

impl FileChannel {
    pub fn new<P: AsRef<Path>>(path: P, timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn send<T: Serialize>(&self, envelope: &Envelope<T>) -> Result<(), ChannelError> {
        let bytes = serde_json::to_vec(envelope).map_err(|e| ChannelError::Malformed {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        match tokio::time::timeout(self.timeout, self.write_atomic(&bytes)).await {
            Ok(result) => result.map_err(|source| ChannelError::Io {
                path: self.path.clone(),
                source,
            }),
            Err(_) => Err(self.timed_out("writing")),
        }
    }

    /// Read and decode the envelope, rejecting any schema other than
    /// `expected_schema`.
    pub async fn recv<T: DeserializeOwned>(
        &self,
        expected_schema: &str,
    ) -> Result<Envelope<T>, ChannelError> {
        let bytes = match tokio::time::timeout(self.timeout, tokio::fs::read(&self.path)).await {
            Ok(result) => result.map_err(|source| ChannelError::Io {
                path: self.path.clone(),
                source,
            })?,
            Err(_) => return Err(self.timed_out("reading")),
        };

        let raw: Envelope<serde_json::Value> =
            serde_json::from_slice(&bytes).map_err(|e| self.malformed(e))?;
        if raw.schema_version != expected_schema {
            return Err(ChannelError::SchemaMismatch {
                expected: expected_schema.to_string(),
                actual: raw.schema_version,
            });
        }
        let payload = serde_json::from_value(raw.payload).map_err(|e| self.malformed(e))?;

        Ok(Envelope {
            schema_version: raw.schema_version,
            job_id: raw.job_id,
            sent_at: raw.sent_at,
            payload,
        })
    }

    async fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let name = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("message");
        let tmp = self.path.with_file_name(format!(
            ".{}.tmp.{}.{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    fn timed_out(&self, operation: &'static str) -> ChannelError {
        ChannelError::Timeout {
            operation,
            path: self.path.clone(),
            timeout_ms: self.timeout.as_millis(),
        }
    }

    fn malformed(&self, e: serde_json::Error) -> ChannelError {
        ChannelError::Malformed {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}
