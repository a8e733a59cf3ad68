use crate::error::{CorralError, Result};
use chrono::Local;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;

/// Default maximum log file size before rotation (10MB)
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Which output stream of a child a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One append-only destination file
struct SinkFile {
    path: PathBuf,
    file: TokioFile,
    size: u64,
    /// Only regular files are rotated, `/dev/null` and friends are not
    rotatable: bool,
}

impl SinkFile {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CorralError::Log(format!(
                        "Failed to create log directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CorralError::LogFile(format!("{}: {}", path.display(), e)))?;

        let metadata = file.metadata().ok();
        let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);
        let rotatable = metadata.map(|m| m.is_file()).unwrap_or(false);

        Ok(Self {
            path: path.to_path_buf(),
            file: TokioFile::from_std(file),
            size,
            rotatable,
        })
    }

    async fn write(&mut self, data: &[u8], max_size: u64) -> Result<()> {
        if self.rotatable && max_size > 0 && self.size >= max_size {
            self.rotate().await?;
        }

        self.file
            .write_all(data)
            .await
            .map_err(|e| CorralError::Log(format!("Failed to write to log: {}", e)))?;
        self.file
            .flush()
            .await
            .map_err(|e| CorralError::Log(format!("Failed to flush log: {}", e)))?;

        self.size += data.len() as u64;
        Ok(())
    }

    /// Rename the current file to `<stem>-<timestamp>.<ext>` and start a fresh one
    async fn rotate(&mut self) -> Result<()> {
        let rotated = rotated_path(&self.path)?;

        tokio::fs::rename(&self.path, &rotated)
            .await
            .map_err(|e| CorralError::Log(format!("Failed to rotate log: {}", e)))?;

        tracing::debug!(from = %self.path.display(), to = %rotated.display(), "Rotated log file");

        *self = Self::open(&self.path)?;
        Ok(())
    }
}

fn rotated_path(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| CorralError::Log("Invalid log file path".to_string()))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CorralError::Log("Invalid log file name".to_string()))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("log");
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");

    let mut candidate = parent.join(format!("{}-{}.{}", stem, timestamp, ext));
    let mut n = 1;
    while candidate.exists() {
        candidate = parent.join(format!("{}-{}.{}.{}", stem, timestamp, n, ext));
        n += 1;
    }
    Ok(candidate)
}

/// Open stdout/stderr destinations for one app (or one instance of it)
pub struct LogSink {
    stdout: SinkFile,
    stderr: SinkFile,
    max_size: u64,
}

impl LogSink {
    pub fn open(stdout_path: &Path, stderr_path: &Path, max_size: u64) -> Result<Self> {
        Ok(Self {
            stdout: SinkFile::open(stdout_path)?,
            stderr: SinkFile::open(stderr_path)?,
            max_size,
        })
    }

    /// Append an already formatted line
    pub async fn write(&mut self, stream: OutputStream, line: &[u8]) -> Result<()> {
        let max_size = self.max_size;
        match stream {
            OutputStream::Stdout => self.stdout.write(line, max_size).await,
            OutputStream::Stderr => self.stderr.write(line, max_size).await,
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        for file in [&mut self.stdout, &mut self.stderr] {
            file.file
                .flush()
                .await
                .map_err(|e| CorralError::Log(format!("Failed to flush log: {}", e)))?;
        }
        Ok(())
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout.path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr.path
    }

    pub fn stdout_size(&self) -> u64 {
        self.stdout.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_sink(dir: &TempDir, max_size: u64) -> LogSink {
        LogSink::open(
            &dir.path().join("app-out.log"),
            &dir.path().join("app-error.log"),
            max_size,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_files() {
        let temp_dir = TempDir::new().unwrap();
        let sink = open_sink(&temp_dir, DEFAULT_MAX_LOG_SIZE);
        assert!(sink.stdout_path().exists());
        assert!(sink.stderr_path().exists());
    }

    #[tokio::test]
    async fn test_streams_go_to_their_own_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = open_sink(&temp_dir, DEFAULT_MAX_LOG_SIZE);

        sink.write(OutputStream::Stdout, b"hello out\n").await.unwrap();
        sink.write(OutputStream::Stderr, b"hello err\n").await.unwrap();
        sink.flush().await.unwrap();

        let out = tokio::fs::read_to_string(sink.stdout_path()).await.unwrap();
        let err = tokio::fs::read_to_string(sink.stderr_path()).await.unwrap();
        assert_eq!(out, "hello out\n");
        assert_eq!(err, "hello err\n");
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("app-out.log"), "old\n").unwrap();

        let mut sink = open_sink(&temp_dir, DEFAULT_MAX_LOG_SIZE);
        assert_eq!(sink.stdout_size(), 4);
        sink.write(OutputStream::Stdout, b"new\n").await.unwrap();

        let out = tokio::fs::read_to_string(sink.stdout_path()).await.unwrap();
        assert_eq!(out, "old\nnew\n");
    }

    #[tokio::test]
    async fn test_log_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = open_sink(&temp_dir, 64);

        for _ in 0..10 {
            sink.write(OutputStream::Stdout, b"This is a test log entry\n")
                .await
                .unwrap();
        }

        let rotated = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("app-out-") && name.ends_with(".log")
            })
            .count();
        assert!(rotated >= 1, "expected rotated files, found {}", rotated);
        assert!(sink.stdout_size() < 64 + 26);
    }

    #[tokio::test]
    async fn test_dev_null_is_never_rotated() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = LogSink::open(
            Path::new("/dev/null"),
            &temp_dir.path().join("err.log"),
            1,
        )
        .unwrap();

        sink.write(OutputStream::Stdout, b"discarded\n").await.unwrap();
        sink.write(OutputStream::Stdout, b"discarded\n").await.unwrap();
        assert!(Path::new("/dev/null").exists());
    }
}
