//! Source enumeration and deterministic batch packing.
//!
//! Every run re-enumerates its sources and must arrive at the same chunk
//! list and the same batch indices — resume depends on it.  Chunks carry a
//! stable label; batches are greedy prefix packs under a character budget.

use std::path::PathBuf;

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::BootstrapError;

/// Characters per chunk when splitting a large source file.
const FILE_CHUNK_CHARS: usize = 8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChunk {
    /// Stable identifier, e.g. `memory:notes/today.md#2`.
    pub label: String,
    pub text: String,
}

/// A historical-content provider.  The workspace walker lives here; host
/// session stores and log archives implement this on their side of the
/// boundary.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Chunks in a deterministic order.
    async fn chunks(&self) -> Result<Vec<SourceChunk>, BootstrapError>;
}

/// Markdown memory files under a workspace directory.
pub struct WorkspaceMemorySource {
    root: PathBuf,
}

impl WorkspaceMemorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ChunkSource for WorkspaceMemorySource {
    async fn chunks(&self) -> Result<Vec<SourceChunk>, BootstrapError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
            .map(|e| e.path().to_path_buf())
            .collect();
        files.sort();

        let mut chunks = Vec::new();
        for file in files {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| BootstrapError::io(&file, e))?;
            let rel = file
                .strip_prefix(&self.root)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            chunks.extend(split_file(&rel, &text));
        }
        Ok(chunks)
    }
}

fn split_file(rel: &str, text: &str) -> Vec<SourceChunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(FILE_CHUNK_CHARS)
        .enumerate()
        .map(|(index, piece)| SourceChunk {
            label: format!("memory:{rel}#{index}"),
            text: piece.iter().collect(),
        })
        .collect()
}

// ── Batching ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub chunks: Vec<SourceChunk>,
}

impl Batch {
    pub fn labels(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.label.clone()).collect()
    }

    pub fn char_count(&self) -> usize {
        self.chunks.iter().map(|c| c.text.chars().count()).sum()
    }
}

/// Greedy prefix packing: consecutive chunks share a batch while their
/// concatenated character count stays within `char_budget`.  A budget of 0
/// disables packing — one chunk per batch.  Indices are assigned in order.
pub fn pack_batches(chunks: Vec<SourceChunk>, char_budget: usize) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();

    if char_budget == 0 {
        for (index, chunk) in chunks.into_iter().enumerate() {
            batches.push(Batch {
                index,
                chunks: vec![chunk],
            });
        }
        return batches;
    }

    let mut current: Vec<SourceChunk> = Vec::new();
    let mut current_chars = 0usize;
    for chunk in chunks {
        let chunk_chars = chunk.text.chars().count();
        if !current.is_empty() && current_chars + chunk_chars > char_budget {
            batches.push(Batch {
                index: batches.len(),
                chunks: std::mem::take(&mut current),
            });
            current_chars = 0;
        }
        current_chars += chunk_chars;
        current.push(chunk);
    }
    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            chunks: current,
        });
    }
    batches
}

// ── Tests ─────────────────────────────────────────────────────────────────────
