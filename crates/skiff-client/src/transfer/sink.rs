//! Destinations for verified piece bytes.
//!
//! Pieces arrive in any order, so every write is addressed by index. The
//! sink is chosen once when a download starts and never changes.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use skiff_shared::protocol::FileMetadata;
use skiff_shared::types::FileId;
use skiff_store::PieceStore;

use crate::context::SessionContext;
use crate::error::Result;
use crate::events::Artifact;

pub enum PieceSink {
    /// Pieces go to the piece store and are concatenated on completion.
    Assembly {
        file_id: FileId,
        store: Arc<dyn PieceStore>,
    },
    /// Pieces are written straight into a preallocated file.
    Streaming {
        file: File,
        part_path: PathBuf,
        final_path: PathBuf,
    },
}

impl PieceSink {
    /// Pick the sink for `metadata`: the store when the file is under the
    /// assembly threshold and a store exists, otherwise a file on disk.
    pub async fn open(ctx: &SessionContext, metadata: &FileMetadata) -> Result<Self> {
        if metadata.file_size < ctx.config.assembly_threshold {
            if let Some(store) = &ctx.store {
                let store = Arc::clone(store);
                let file_id = metadata.file_id;
                // Leftovers from an earlier attempt
                let cleanup = Arc::clone(&store);
                tokio::task::spawn_blocking(move || cleanup.delete_all_for_file(&file_id))
                    .await??;
                return Ok(PieceSink::Assembly { file_id, store });
            }
            debug!(file_id = %metadata.file_id, "No piece store, streaming instead");
        }

        Self::streaming(&ctx.config.download_dir, metadata).await
    }

    async fn streaming(dir: &Path, metadata: &FileMetadata) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let name = sanitize_file_name(&metadata.file_name);
        let id = metadata.file_id.to_string();
        let final_path = dir.join(format!("{}-{}", &id[..8], name));
        let part_path = dir.join(format!("{id}.part"));

        let file = File::create(&part_path).await?;
        file.set_len(metadata.file_size).await?;

        Ok(PieceSink::Streaming {
            file,
            part_path,
            final_path,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PieceSink::Assembly { .. } => "assembly",
            PieceSink::Streaming { .. } => "streaming",
        }
    }

    /// Write piece `index`, which starts at byte `offset` of the file.
    pub async fn write(&mut self, index: u32, offset: u64, data: Vec<u8>) -> Result<()> {
        match self {
            PieceSink::Assembly { file_id, store } => {
                let store = Arc::clone(store);
                let file_id = *file_id;
                tokio::task::spawn_blocking(move || store.put(&file_id, index, &data)).await??;
            }
            PieceSink::Streaming { file, .. } => {
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(&data).await?;
            }
        }
        Ok(())
    }

    /// Produce the finished artifact from `piece_count` written pieces.
    pub async fn finalize(self, piece_count: u32) -> Result<Artifact> {
        match self {
            PieceSink::Assembly { file_id, store } => {
                let pieces = {
                    let store = Arc::clone(&store);
                    tokio::task::spawn_blocking(move || store.get_all_for_file(&file_id)).await??
                };

                let contiguous = pieces.len() == piece_count as usize
                    && pieces.iter().enumerate().all(|(i, (idx, _))| *idx as usize == i);
                if !contiguous {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("stored {} of {piece_count} pieces", pieces.len()),
                    )
                    .into());
                }

                let total: usize = pieces.iter().map(|(_, d)| d.len()).sum();
                let mut bytes = Vec::with_capacity(total);
                for (_, data) in pieces {
                    bytes.extend_from_slice(&data);
                }

                tokio::task::spawn_blocking(move || store.delete_all_for_file(&file_id)).await??;
                Ok(Artifact::Memory(Arc::new(bytes)))
            }
            PieceSink::Streaming {
                mut file,
                part_path,
                final_path,
            } => {
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                tokio::fs::rename(&part_path, &final_path).await?;
                Ok(Artifact::Disk(final_path))
            }
        }
    }

    /// Discard everything written so far.
    pub async fn abort(self) {
        match self {
            PieceSink::Assembly { file_id, store } => {
                let result =
                    tokio::task::spawn_blocking(move || store.delete_all_for_file(&file_id)).await;
                if !matches!(result, Ok(Ok(()))) {
                    warn!(file_id = %file_id, "Failed to delete stored pieces");
                }
            }
            PieceSink::Streaming {
                file, part_path, ..
            } => {
                drop(file);
                if let Err(e) = tokio::fs::remove_file(&part_path).await {
                    warn!(path = %part_path.display(), error = %e, "Failed to remove partial file");
                }
            }
        }
    }
}

/// Strip any directory components a remote peer put in the name.
fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("download")
        .to_string()
}
