//! Zip extraction and creation. Both functions block; call them from `spawn_blocking`.

use std::{
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
};

use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::error::{Error, Result};

fn normalize_rel_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(Error::Validation(format!(
                    "archive entry {rel:?} escapes the target directory"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(Error::Validation(format!(
                    "archive entry {rel:?} is not relative"
                )));
            }
        }
    }
    Ok(out)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Unpacks `zip_path` under `out_dir`, rejecting entries that would land outside it.
pub fn extract_zip_safely(zip_path: &Path, out_dir: &Path) -> Result<usize> {
    fs::create_dir_all(out_dir).map_err(|e| Error::io_at("create", out_dir, e))?;
    let f = fs::File::open(zip_path).map_err(|e| Error::io_at("open", zip_path, e))?;
    let mut archive = ZipArchive::new(f)
        .map_err(|e| Error::archive(format!("read {}", zip_path.display()), e))?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::archive(format!("entry {i} of {}", zip_path.display()), e))?;
        let name = file.name().replace('\\', "/");
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        if name.ends_with('/') {
            fs::create_dir_all(&out_path).map_err(|e| Error::io_at("create", &out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at("create", parent, e))?;
        }
        let tmp_path = part_path(&out_path);
        let mut out =
            fs::File::create(&tmp_path).map_err(|e| Error::io_at("create", &tmp_path, e))?;
        std::io::copy(&mut file, &mut out).map_err(|e| Error::io_at("write", &tmp_path, e))?;
        out.sync_all().ok();
        drop(out);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| Error::io_at("chmod", &tmp_path, e))?;
            }
        }

        fs::rename(&tmp_path, &out_path).map_err(|e| Error::io_at("rename", &out_path, e))?;
        written += 1;
    }
    Ok(written)
}

/// Packs the contents of `src_dir` into a new zip at `dest`, returning the number of files.
pub fn zip_dir(src_dir: &Path, dest: &Path) -> Result<usize> {
    if !src_dir.is_dir() {
        return Err(Error::not_found("directory", src_dir.display().to_string()));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at("create", parent, e))?;
    }

    let tmp = part_path(dest);
    let f = fs::File::create(&tmp).map_err(|e| Error::io_at("create", &tmp, e))?;
    let mut zip = ZipWriter::new(f);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut count = 0;
    let mut stack = vec![src_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<_> = fs::read_dir(&dir)
            .map_err(|e| Error::io_at("list", &dir, e))?
            .flatten()
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let rel = path
                .strip_prefix(src_dir)
                .map_err(|e| Error::Internal(anyhow::anyhow!("{e}")))?;
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let file_type = entry
                .file_type()
                .map_err(|e| Error::io_at("stat", &path, e))?;
            if file_type.is_dir() {
                zip.add_directory(format!("{name}/"), options)
                    .map_err(|e| Error::archive(format!("add {name}"), e))?;
                stack.push(path);
            } else if file_type.is_file() {
                zip.start_file(name.clone(), options)
                    .map_err(|e| Error::archive(format!("add {name}"), e))?;
                let mut src = fs::File::open(&path).map_err(|e| Error::io_at("open", &path, e))?;
                std::io::copy(&mut src, &mut zip).map_err(|e| Error::io_at("read", &path, e))?;
                count += 1;
            }
        }
    }

    let mut f = zip
        .finish()
        .map_err(|e| Error::archive(format!("finish {}", dest.display()), e))?;
    f.flush().map_err(|e| Error::io_at("flush", &tmp, e))?;
    drop(f);
    fs::rename(&tmp, dest).map_err(|e| Error::io_at("rename", dest, e))?;
    Ok(count)
}
