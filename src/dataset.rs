use crate::error::DatasetError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub filename: String,
    pub content: String,
    pub file_size: u64,
}

fn list_txt_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();
    files
}

/// Loads one named dataset from `dir`.
pub fn load_dataset(dir: &Path, name: &str) -> Result<Dataset, DatasetError> {
    let path = dir.join(name);
    if !path.is_file() {
        let available = list_txt_files(dir)
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        return Err(DatasetError::NotFound {
            name: name.to_string(),
            available,
        });
    }
    let content = fs::read_to_string(&path)?;
    let file_size = fs::metadata(&path)?.len();
    info!(
        "Dataset loaded: {} ({} characters, {} bytes)",
        name,
        content.chars().count(),
        file_size
    );
    Ok(Dataset {
        filename: name.to_string(),
        content,
        file_size,
    })
}

/// Every non-empty `.txt` file in `dir`, trimmed. Unreadable files are skipped.
pub fn read_text_files(dir: &Path) -> Vec<Dataset> {
    let files = list_txt_files(dir);
    if files.is_empty() {
        warn!("No .txt files found in {}", dir.display());
    }

    let mut datasets = Vec::new();
    for path in files {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match fs::read_to_string(&path) {
            Ok(content) => {
                let content = content.trim().to_string();
                if content.is_empty() {
                    info!("  - {} (EMPTY - skipping)", filename);
                    continue;
                }
                let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                info!(
                    "  - {} ({} bytes, {} words)",
                    filename,
                    file_size,
                    content.split_whitespace().count()
                );
                datasets.push(Dataset {
                    filename,
                    content,
                    file_size,
                });
            }
            Err(e) => warn!("  - ERROR reading {}: {}", filename, e),
        }
    }
    datasets
}
