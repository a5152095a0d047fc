//! Incremental log tail
//!
//! Starts at the end of the file as it is when the tail is created, so
//! markers written by a previous start are ignored. A file that shrinks is
//! treated as rotated and read again from the beginning.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Follows one log file looking for startup markers
#[derive(Debug, Clone)]
pub struct LogTail {
    path: PathBuf,
    markers: Vec<String>,
    offset: u64,
    partial: Vec<u8>,
}

impl LogTail {
    /// Tail `path` from its current end
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, markers: Vec<String>) -> Self {
        let path = path.into();
        let offset = std::fs::metadata(&path).map_or(0, |m| m.len());
        Self {
            path,
            markers,
            offset,
            partial: Vec::new(),
        }
    }

    /// File being followed
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read lines appended since the last call; returns the first one holding a marker
    ///
    /// A trailing line without a newline is kept as raw bytes until it is
    /// complete, so a character split across reads decodes intact.
    ///
    /// # Errors
    /// IO errors other than the file not existing yet.
    pub async fn poll_markers(&mut self) -> std::io::Result<Option<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.offset = 0;
                self.partial.clear();
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::debug!("{} was truncated, reading from the start", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut appended = Vec::new();
        file.take(len - self.offset).read_to_end(&mut appended).await?;
        self.offset += appended.len() as u64;
        self.partial.extend_from_slice(&appended);

        let mut found = None;
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end();
            if found.is_none() && self.markers.iter().any(|m| line.contains(m.as_str())) {
                found = Some(line.to_string());
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn markers() -> Vec<String> {
        vec!["Started LegionApplication".to_string()]
    }

    fn append(path: &Path, text: &str) {
        append_bytes(path, text.as_bytes());
    }

    fn append_bytes(path: &Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new().append(true).create(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    #[tokio::test]
    async fn ignores_lines_written_before_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        append(&log, "INFO Started LegionApplication in 80s\n");

        let mut tail = LogTail::new(&log, markers());
        assert_eq!(tail.poll_markers().await.unwrap(), None);

        append(&log, "INFO Tomcat started\nINFO Started LegionApplication in 75s\n");
        assert_eq!(
            tail.poll_markers().await.unwrap().as_deref(),
            Some("INFO Started LegionApplication in 75s")
        );
    }

    #[tokio::test]
    async fn waits_for_the_line_to_complete() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let mut tail = LogTail::new(&log, markers());

        append(&log, "INFO Started Legion");
        assert_eq!(tail.poll_markers().await.unwrap(), None);
        append(&log, "Application\n");
        assert!(tail.poll_markers().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rereads_a_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        append(&log, "a long line from the previous run that makes the file big\n");
        let mut tail = LogTail::new(&log, markers());

        std::fs::write(&log, "Started LegionApplication\n").unwrap();
        assert_eq!(
            tail.poll_markers().await.unwrap().as_deref(),
            Some("Started LegionApplication")
        );
    }

    #[tokio::test]
    async fn character_split_across_reads_still_matches() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let mut tail = LogTail::new(&log, vec!["Démarrage terminé".to_string()]);

        let line = "INFO Démarrage terminé\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        append_bytes(&log, &line[..split]);
        assert_eq!(tail.poll_markers().await.unwrap(), None);
        append_bytes(&log, &line[split..]);
        assert_eq!(
            tail.poll_markers().await.unwrap().as_deref(),
            Some("INFO Démarrage terminé")
        );
    }
}
