//! Content-type lookup for served files.
//!
//! The table is loaded from a mime-types file (`type ext1 ext2 …`, `#`
//! comments) and swapped in place on reload so lookups never see a
//! half-built table.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use tracing::warn;

#[derive(Debug, Default)]
pub struct MimeTypes {
    table: RwLock<HashMap<String, String>>,
}

impl MimeTypes {
    pub fn new() -> MimeTypes {
        MimeTypes::default()
    }

    /// Parse `path` and swap the table in place. A missing or unreadable
    /// file leaves the current table untouched.
    pub fn reload(&self, path: &Path) {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) => {
                warn!("cannot open mime types file {}: {err}", path.display());
                return;
            }
        };
        let mut table = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(mimetype) = fields.next() else {
                continue;
            };
            for ext in fields {
                table.insert(ext.to_ascii_lowercase(), mimetype.to_string());
            }
        }
        *self.table.write() = table;
    }

    /// Content type for a path, with builtin fallbacks for the formats the
    /// server most commonly carries.
    pub fn content_type(&self, path: &str) -> String {
        let ext = match extension(path) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => return "text/html".to_string(),
        };
        if let Some(mimetype) = self.table.read().get(&ext) {
            return mimetype.clone();
        }
        match ext.as_str() {
            "ogg" => "application/ogg",
            "mp3" => "audio/mpeg",
            "html" => "text/html",
            "css" => "text/css",
            "txt" => "text/plain",
            "jpg" => "image/jpeg",
            "png" => "image/png",
            "m3u" => "audio/x-mpegurl",
            "aac" => "audio/aac",
            _ => "application/octet-stream",
        }
        .to_string()
    }
}

pub fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() && !name.starts_with('.') {
        return None;
    }
    if ext.is_empty() { None } else { Some(ext) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_mime_file_and_overrides_builtin() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "# comment line").unwrap();
        writeln!(file, "audio/x-mpeg mp3 mpga").unwrap();
        writeln!(file, "application/x-foo foo").unwrap();
        let mime = MimeTypes::new();
        mime.reload(file.path());
        assert_eq!(mime.content_type("/music/track.mp3"), "audio/x-mpeg");
        assert_eq!(mime.content_type("a.mpga"), "audio/x-mpeg");
        assert_eq!(mime.content_type("x.foo"), "application/x-foo");
    }

    #[test]
    fn builtin_fallbacks() {
        let mime = MimeTypes::new();
        assert_eq!(mime.content_type("/stream.ogg"), "application/ogg");
        assert_eq!(mime.content_type("/intro.mp3"), "audio/mpeg");
        assert_eq!(mime.content_type("/x.unknown"), "application/octet-stream");
        assert_eq!(mime.content_type("/noext"), "text/html");
    }

    #[test]
    fn reload_failure_keeps_old_table() {
        let mime = MimeTypes::new();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "audio/x-test tst").unwrap();
        mime.reload(file.path());
        mime.reload(Path::new("/nonexistent/mime.types"));
        assert_eq!(mime.content_type("a.tst"), "audio/x-test");
    }
}
