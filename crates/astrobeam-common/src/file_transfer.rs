use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::protocol::{FileMetadata, CHUNK_SIZE};

pub const MAX_FILENAME_BYTES: usize = 255;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const MAX_NAME_ATTEMPTS: u32 = 9_999;

/// File being sent, read front to back one chunk at a time.
pub struct OutgoingFile {
    metadata: FileMetadata,
    file: File,
    chunk_size: usize,
    bytes_read: u64,
}

impl OutgoingFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::with_chunk_size(path, CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: &Path, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::config("chunk_size must be non-zero"));
        }

        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(Error::config(format!("not a regular file: {}", path.display())));
        }
        if meta.len() == 0 {
            return Err(Error::config(format!(
                "empty files are not supported: {}",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(sanitize_filename)
            .ok_or_else(|| Error::config(format!("invalid filename: {}", path.display())))?;
        let file = File::open(path)?;

        Ok(Self {
            metadata: FileMetadata {
                mime_type: guess_mime_type(&name).to_string(),
                name,
                size: meta.len(),
            },
            file,
            chunk_size,
            bytes_read: 0,
        })
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn finished(&self) -> bool {
        self.bytes_read >= self.metadata.size
    }

    /// Read the next slice. `None` once the declared size has been read.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished() {
            return Ok(None);
        }

        let remaining = self.metadata.size - self.bytes_read;
        let len = remaining.min(self.chunk_size as u64) as usize;
        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;

        self.bytes_read += len as u64;
        Ok(Some(Bytes::from(payload)))
    }
}

pub fn sanitize_filename(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let base = Path::new(trimmed).file_name()?.to_string_lossy();
    let mut clean = String::with_capacity(base.len().min(MAX_FILENAME_BYTES));
    for ch in base.chars() {
        let safe = ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ' ');
        clean.push(if safe { ch } else { '_' });
        if clean.len() >= MAX_FILENAME_BYTES {
            break;
        }
    }
    let clean = clean.trim().trim_matches('.').to_string();
    if clean.is_empty() || clean == "." || clean == ".." {
        return None;
    }
    Some(clean)
}

/// Mime type from the file extension; browsers send `""` when unknown,
/// we fall back to `application/octet-stream`.
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// Write a received file into `output_dir` without clobbering anything
/// already there. Returns the path written.
pub fn save_received(output_dir: &Path, metadata: &FileMetadata, data: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let name = sanitize_filename(&metadata.name).unwrap_or_else(|| "received.bin".to_string());
    let destination = unique_destination_path(&output_dir.join(name), MAX_NAME_ATTEMPTS)?;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&destination)?
        .write_all(data)?;
    Ok(destination)
}

/// `path`, or the first free `name (n).ext` with `n <= attempts`.
fn unique_destination_path(path: &Path, attempts: u32) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    for n in 1..=attempts {
        let candidate = if ext.is_empty() {
            path.with_file_name(format!("{stem} ({n})"))
        } else {
            path.with_file_name(format!("{stem} ({n}).{ext}"))
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free file name left for {}", path.display()),
    )))
}
