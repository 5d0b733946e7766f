//! Watchdog log file: one summary line per pass, tailed by the panel.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

/// Append-only log truncated to its last `max_lines` lines.
#[derive(Debug, Clone)]
pub struct WatchdogLog {
    path: PathBuf,
    max_lines: usize,
}

impl WatchdogLog {
    pub fn new(path: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            path: path.into(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line (a timestamp is prepended) and rotate if needed.
    pub async fn append(&self, message: &str) -> Result<()> {
        self.append_unrotated(message).await?;
        self.rotate().await
    }

    /// Append without rotating. Used by writers that do not hold the pass lock.
    pub async fn append_unrotated(&self, message: &str) -> Result<()> {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("{stamp} {}\n", message.replace('\n', " "));

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open log {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Keep only the newest `max_lines` lines.
    async fn rotate(&self) -> Result<()> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let count = content.lines().count();
        if count <= self.max_lines {
            return Ok(());
        }
        let kept: Vec<&str> = content.lines().skip(count - self.max_lines).collect();
        let mut out = kept.join("\n");
        out.push('\n');
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(format!(".{}.tmp", std::process::id()));
        let tmp_path = self.path.with_file_name(tmp_name);
        tokio::fs::write(&tmp_path, out.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to rotate log {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), dropped = count - self.max_lines, "log rotated");
        Ok(())
    }

    /// Last `lines` lines, newline-joined. A missing file reads as empty.
    pub async fn tail(&self, lines: usize) -> Result<String> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read log {}", self.path.display()))
            }
        };
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].join("\n"))
    }
}
