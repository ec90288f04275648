//! Stream format typing and format-aware file reads.
//!
//! Fallback handles carry a format so a listener is never moved onto a live
//! source of a different type, and so file reads come out in blocks the
//! format can tolerate.

use std::fs::File;
use std::io;

/// Broad content format of a mount or served file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatType {
    Mp3,
    Ogg,
    Aac,
    /// Not yet determined, eg an unused on-demand relay.
    Undefined,
}

impl FormatType {
    pub fn from_content_type(content_type: &str) -> FormatType {
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim();
        match ct {
            "audio/mpeg" | "audio/x-mpeg" => FormatType::Mp3,
            "application/ogg" | "audio/ogg" | "video/ogg" => FormatType::Ogg,
            "audio/aac" | "audio/aacp" => FormatType::Aac,
            _ => FormatType::Undefined,
        }
    }

    /// Whether a listener of this type may attach to a source of `other`.
    pub fn compatible(self, other: FormatType) -> bool {
        self == other || other == FormatType::Undefined || self == FormatType::Undefined
    }
}

/// Result of one format-aware read from a served file.
#[derive(Debug)]
pub enum FileRead {
    Block(Vec<u8>),
    /// End of file on a looping fallback; restart from offset 0.
    Loop,
    /// Non-recoverable; terminate the listener.
    Fatal,
}

/// Per-handle format plugin for typed fallback files.
#[derive(Debug)]
pub struct FormatHandler {
    ftype: FormatType,
    block_size: usize,
}

impl FormatHandler {
    pub fn new(ftype: FormatType) -> Option<FormatHandler> {
        if ftype == FormatType::Undefined {
            return None;
        }
        // mpeg frames tolerate arbitrary splits but smaller blocks keep the
        // throttle window granular
        let block_size = match ftype {
            FormatType::Mp3 | FormatType::Aac => 4096,
            _ => 8192,
        };
        Some(FormatHandler { ftype, block_size })
    }

    pub fn format_type(&self) -> FormatType {
        self.ftype
    }

    /// Read the next block at `offset`.
    pub fn file_read(&self, file: &File, offset: u64) -> FileRead {
        let mut buf = vec![0u8; self.block_size];
        match read_at(file, &mut buf, offset) {
            Ok(0) => FileRead::Loop,
            Ok(n) => {
                buf.truncate(n);
                FileRead::Block(buf)
            }
            Err(_) => FileRead::Fatal,
        }
    }
}

/// Positional read that leaves the shared handle's cursor alone.
#[cfg(unix)]
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
