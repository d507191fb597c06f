//! Backup artifact format detection by content signature.

use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::error::{StandError, StandResult};

/// Bytes inspected when sniffing a backup file.
const SNIFF_LEN: usize = 8192;
const CUSTOM_DUMP_MAGIC: &[u8] = b"PGDMP";
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFormat {
    /// SQL script to be streamed through `psql`.
    PlainSql,
    /// `pg_dump --format c` archive.
    CustomDump,
    /// POSIX tar: a `pg_dump --format t` archive or a data-directory snapshot.
    TarArchive,
    /// `pg_dump --format d` output directory.
    Directory,
}

/// Classify the leading bytes of a backup file.
pub fn classify(header: &[u8]) -> Option<BackupFormat> {
    if header.starts_with(CUSTOM_DUMP_MAGIC) {
        return Some(BackupFormat::CustomDump);
    }
    if header.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
    {
        return Some(BackupFormat::TarArchive);
    }
    if is_text(header) {
        return Some(BackupFormat::PlainSql);
    }
    None
}

fn is_text(header: &[u8]) -> bool {
    if header.is_empty() || header.contains(&0) {
        return false;
    }
    let text = match std::str::from_utf8(header) {
        Ok(text) => text,
        // Sniff window cut a multi-byte character in half.
        Err(e) if e.error_len().is_none() => match std::str::from_utf8(&header[..e.valid_up_to()]) {
            Ok(text) => text,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    text.chars()
        .all(|c| !c.is_control() || c.is_ascii_whitespace() || c == '\u{1b}')
}

/// Detect the format of the backup at `path`.
pub async fn detect(path: &Path) -> StandResult<BackupFormat> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| StandError::backend("detect backup format", format!("{}: {e}", path.display())))?;
    if metadata.is_dir() {
        return Ok(BackupFormat::Directory);
    }

    let mut file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(SNIFF_LEN);
    (&mut file).take(SNIFF_LEN as u64).read_to_end(&mut header).await?;

    classify(&header).ok_or_else(|| {
        tracing::error!(path = %path.display(), "Unrecognized backup file type");
        StandError::backend(
            "detect backup format",
            format!("wrong backup format: {}", path.display()),
        )
    })
}
