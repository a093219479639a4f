// src/file_manager.rs - Resolves and validates printable files under the G-code directory
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["gcode", "g", "gco"];

#[derive(Debug, Error)]
pub enum FileManagerError {
    #[error("File {0} does not exist")]
    NotFound(String),
    #[error("Unsupported file type: {0}")]
    UnsupportedExtension(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: std::time::SystemTime,
}

#[derive(Debug, Clone)]
pub struct FileManager {
    gcode_dir: PathBuf,
}

impl FileManager {
    pub fn new(gcode_dir: impl Into<PathBuf>) -> Self {
        Self { gcode_dir: gcode_dir.into() }
    }

    /// Names are relative to the G-code directory; a leading `gcodes/` root is accepted.
    pub fn resolve(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let relative = filename.strip_prefix("gcodes/").unwrap_or(filename);
        self.gcode_dir.join(relative)
    }

    pub fn is_supported(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    }

    /// Checks type and existence before a file is handed to the print manager.
    pub async fn inspect(&self, filename: &str) -> Result<FileInfo, FileManagerError> {
        let path = self.resolve(filename);
        if !Self::is_supported(&path) {
            return Err(FileManagerError::UnsupportedExtension(filename.to_string()));
        }
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(FileManagerError::NotFound(filename.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileManagerError::NotFound(filename.to_string()));
            }
            Err(e) => return Err(FileManagerError::Io(e)),
        };
        tracing::debug!("Resolved {} to {}", filename, path.display());
        Ok(FileInfo {
            name: filename.to_string(),
            path,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        })
    }

    /// Printable files directly under the G-code directory, sorted by name.
    pub async fn list_files(&self) -> Result<Vec<FileInfo>, FileManagerError> {
        let mut entries = fs::read_dir(&self.gcode_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if !metadata.is_file() || !Self::is_supported(&path) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.push(FileInfo {
                    name: name.to_string(),
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                    path: path.clone(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
