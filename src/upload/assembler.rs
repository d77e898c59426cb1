//! Session-scoped chunked upload assembler.
//!
//! # Session State Machine
//!
//! ```text
//! [init] --chunk(i)--> [partial] --all chunks + complete--> [assembling]
//! [assembling] --ok--> [accepted]      (session deleted)
//! [assembling] --io/disk error--> [failed]  (session deleted, temp removed)
//! [any] --cancel--> [cancelled]        (session deleted, temp removed)
//! ```
//!
//! Chunk files are named `chunk_{index:06}`, a pure function of the index,
//! so concurrent writes to different indices never contend. Re-uploading an
//! index overwrites the previous chunk file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::UploadError;
use crate::sys;

/// Server-chosen chunk size: 8 MiB.
pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Accepted source file extensions (lowercase, with dot).
pub const SUPPORTED_EXTENSIONS: [&str; 4] = [".tif", ".tiff", ".psb", ".psd"];

/// One in-flight chunked upload. Never persisted; lives until completion or
/// cancellation.
struct UploadSession {
    filename: String,
    filesize: u64,
    total_chunks: u32,
    received: HashSet<u32>,
    temp_dir: PathBuf,
}

/// Snapshot of a session for status responses.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadSessionInfo {
    pub upload_id: Uuid,
    pub filename: String,
    pub filesize: u64,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub chunk_size: u64,
}

/// Result of an `append_chunk` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChunkReceipt {
    pub received: u32,
    pub total: u32,
    pub complete: bool,
}

/// A fully assembled upload ready for dataset creation.
#[derive(Debug, Clone)]
pub struct AssembledUpload {
    pub filename: String,
    pub path: PathBuf,
    pub filesize: u64,
}

/// Accepts chunked uploads and concatenates them into final source files.
pub struct UploadAssembler {
    sessions: Mutex<HashMap<Uuid, UploadSession>>,
    temp_root: PathBuf,
    upload_root: PathBuf,
    max_upload_size: u64,
}

impl UploadAssembler {
    pub fn new(temp_root: PathBuf, upload_root: PathBuf, max_upload_size: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            temp_root,
            upload_root,
            max_upload_size,
        }
    }

    /// Open a new upload session.
    ///
    /// Validates the extension and declared size, creates the session's
    /// staging directory and returns the id plus the server-chosen chunk
    /// size the client must slice by.
    pub async fn init(
        &self,
        filename: &str,
        filesize: u64,
        total_chunks: u32,
    ) -> Result<UploadSessionInfo, UploadError> {
        validate_extension(filename)?;

        if filesize > self.max_upload_size {
            return Err(UploadError::TooLarge {
                size: filesize,
                limit: self.max_upload_size,
            });
        }

        let upload_id = Uuid::new_v4();
        let temp_dir = self.temp_root.join(upload_id.to_string());
        tokio::fs::create_dir_all(&temp_dir).await?;

        let session = UploadSession {
            filename: sanitize_filename(filename),
            filesize,
            total_chunks,
            received: HashSet::new(),
            temp_dir,
        };

        info!(
            %upload_id,
            filename,
            filesize,
            total_chunks,
            "opened upload session"
        );

        let info = UploadSessionInfo {
            upload_id,
            filename: session.filename.clone(),
            filesize,
            total_chunks,
            received_chunks: 0,
            chunk_size: CHUNK_SIZE,
        };

        self.sessions.lock().await.insert(upload_id, session);
        Ok(info)
    }

    /// Append (or re-send) one chunk. Idempotent per index.
    pub async fn append_chunk(
        &self,
        upload_id: Uuid,
        index: u32,
        data: &[u8],
    ) -> Result<ChunkReceipt, UploadError> {
        // Validate against the session, clone the target path, then write
        // outside the lock so slow disks don't serialize unrelated sessions.
        let (temp_dir, total) = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(&upload_id)
                .ok_or(UploadError::UnknownSession(upload_id))?;

            if index >= session.total_chunks {
                return Err(UploadError::ChunkOutOfRange {
                    index,
                    total: session.total_chunks,
                });
            }
            if data.len() as u64 > CHUNK_SIZE {
                return Err(UploadError::ChunkTooLarge {
                    index,
                    size: data.len() as u64,
                    chunk_size: CHUNK_SIZE,
                });
            }
            (session.temp_dir.clone(), session.total_chunks)
        };

        let chunk_path = temp_dir.join(chunk_file_name(index));
        let mut file = tokio::fs::File::create(&chunk_path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&upload_id)
            .ok_or(UploadError::UnknownSession(upload_id))?;
        session.received.insert(index);

        let received = session.received.len() as u32;
        debug!(%upload_id, index, received, total, "chunk stored");

        Ok(ChunkReceipt {
            received,
            total,
            complete: received == total,
        })
    }

    /// Assemble a completed session into its final file.
    ///
    /// Requires every chunk to be present and roughly twice the file size of
    /// free disk (staged chunks plus the concatenated result coexist until
    /// the temp directory is removed). The session is consumed whether
    /// assembly succeeds or fails; only a missing-chunks error keeps it.
    pub async fn complete(&self, upload_id: Uuid) -> Result<AssembledUpload, UploadError> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get(&upload_id)
                .ok_or(UploadError::UnknownSession(upload_id))?;

            let received = session.received.len() as u32;
            if received != session.total_chunks {
                return Err(UploadError::MissingChunks {
                    received,
                    total: session.total_chunks,
                });
            }
            sessions.remove(&upload_id).expect("session present")
        };

        let needed = session.filesize.saturating_mul(2);
        let available = sys::available_disk_space(&self.upload_root);
        if available < needed {
            remove_dir_best_effort(&session.temp_dir).await;
            return Err(UploadError::InsufficientDisk { needed, available });
        }

        let final_path = self.upload_root.join(&session.filename);
        match assemble_chunks(&session, &final_path).await {
            Ok(filesize) => {
                remove_dir_best_effort(&session.temp_dir).await;
                info!(%upload_id, path = %final_path.display(), filesize, "upload assembled");
                Ok(AssembledUpload {
                    filename: session.filename,
                    path: final_path,
                    filesize,
                })
            }
            Err(e) => {
                remove_dir_best_effort(&session.temp_dir).await;
                let _ = tokio::fs::remove_file(&final_path).await;
                Err(e)
            }
        }
    }

    /// Abort a session, removing staged chunks.
    pub async fn cancel(&self, upload_id: Uuid) -> Result<(), UploadError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(&upload_id)
            .ok_or(UploadError::UnknownSession(upload_id))?;

        remove_dir_best_effort(&session.temp_dir).await;
        info!(%upload_id, "upload cancelled");
        Ok(())
    }

    /// Snapshot a session for status responses.
    pub async fn session_info(&self, upload_id: Uuid) -> Result<UploadSessionInfo, UploadError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(&upload_id)
            .ok_or(UploadError::UnknownSession(upload_id))?;
        Ok(UploadSessionInfo {
            upload_id,
            filename: session.filename.clone(),
            filesize: session.filesize,
            total_chunks: session.total_chunks,
            received_chunks: session.received.len() as u32,
            chunk_size: CHUNK_SIZE,
        })
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Validate extension and size for a single-shot (non-chunked) upload.
    pub fn validate_single_shot(&self, filename: &str, filesize: u64) -> Result<(), UploadError> {
        validate_extension(filename)?;
        if filesize > self.max_upload_size {
            return Err(UploadError::TooLarge {
                size: filesize,
                limit: self.max_upload_size,
            });
        }
        Ok(())
    }

    /// Destination path for an accepted upload.
    pub fn upload_path(&self, filename: &str) -> PathBuf {
        self.upload_root.join(sanitize_filename(filename))
    }
}

/// Concatenate chunks `0..N-1` in order into `final_path`.
async fn assemble_chunks(session: &UploadSession, final_path: &Path) -> Result<u64, UploadError> {
    let mut output = tokio::fs::File::create(final_path).await?;
    let mut written = 0u64;

    for index in 0..session.total_chunks {
        let chunk_path = session.temp_dir.join(chunk_file_name(index));
        let mut chunk = tokio::fs::File::open(&chunk_path).await?;
        written += tokio::io::copy(&mut chunk, &mut output).await?;
    }

    output.flush().await?;
    Ok(written)
}

fn chunk_file_name(index: u32) -> String {
    format!("chunk_{:06}", index)
}

fn validate_extension(filename: &str) -> Result<(), UploadError> {
    let lower = filename.to_lowercase();
    if SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        Ok(())
    } else {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| format!(".{}", e))
            .unwrap_or_else(|| "(none)".to_string());
        Err(UploadError::UnsupportedExtension(ext))
    }
}

/// Keep only the file name component; strip any path separators a client
/// might smuggle in.
fn sanitize_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string())
}

async fn remove_dir_best_effort(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "failed to remove staging directory");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
