//! # Output File
//!
//! The download target is a single regular file, pre-allocated to the full
//! torrent length before any peer traffic starts. Verified pieces land at
//! their absolute byte offset, so writes never extend the file and pieces
//! may arrive in any order.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};

/// A pre-allocated download target.
pub struct OutputFile {
    file: File,
}

impl OutputFile {
    /// Create the file at `path` and allocate exactly `length` bytes.
    pub fn create(path: &Path, length: u64) -> Result<OutputFile> {
        let file = File::create(path)
            .with_context(|| format!("could not create output file {}", path.display()))?;

        file.set_len(length)
            .with_context(|| format!("could not allocate {} bytes for output file", length))?;

        Ok(OutputFile { file })
    }

    /// Write one verified piece at its absolute byte offset.
    pub fn write_piece(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .context("could not seek in output file")?;
        self.file
            .write_all(data)
            .context("could not write piece to output file")?;

        Ok(())
    }
}
