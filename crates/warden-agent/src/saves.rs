use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// An uploaded world archive in the saves directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveInfo {
    /// Index key: the file name with a `.mcworld` extension shown as `.zip`.
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// The stored name for an uploaded file: `.zip` stays, `.mcworld` becomes `.zip`.
pub fn normalize_save_name(file_name: &str) -> Result<String> {
    let file_name = file_name.trim();
    let plain = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| *n == file_name && !n.starts_with('.'));
    let Some(plain) = plain else {
        return Err(Error::Validation(format!(
            "invalid save file name {file_name:?}"
        )));
    };

    match extension(plain).as_deref() {
        Some("zip") => Ok(plain.to_string()),
        Some("mcworld") => Ok(Path::new(plain)
            .with_extension("zip")
            .to_string_lossy()
            .into_owned()),
        _ => Err(Error::Validation(format!(
            "unsupported save archive {plain:?}: expected .mcworld or .zip"
        ))),
    }
}

/// Walks `dir` recursively and indexes every `.zip`/`.mcworld` file by normalized name.
pub async fn scan_dir(dir: &Path) -> Result<HashMap<String, SaveInfo>> {
    let mut out = HashMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&current)
            .await
            .map_err(|e| Error::io_at("list", &current, e))?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| Error::io_at("list", &current, e))?
        {
            let path = entry.path();
            let meta = entry
                .metadata()
                .await
                .map_err(|e| Error::io_at("stat", &path, e))?;
            if meta.is_dir() {
                stack.push(path);
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(name) = normalize_save_name(file_name) else {
                debug!(path = %path.display(), "skipping non-save file");
                continue;
            };
            let last_modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.insert(
                name.clone(),
                SaveInfo {
                    name,
                    path,
                    size: meta.len(),
                    last_modified,
                },
            );
        }
    }
    Ok(out)
}
