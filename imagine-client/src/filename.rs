use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, PersistError};

const MAX_NAME_ATTEMPTS: usize = 1000;

/// `{model}_{first five words}_{hash}_{timestamp}.png`, restricted to
/// `[A-Za-z0-9._- ]`.
pub fn create_filename(model: &str, prompt: &str, now: DateTime<Local>) -> String {
    let words = prompt.split_whitespace().take(5).collect::<Vec<_>>().join(" ");
    let digest = format!("{:x}", Sha256::digest(prompt.as_bytes()));
    let filename = format!(
        "{model}_{words}_{}_{}.png",
        &digest[..8],
        now.format("%Y%m%d_%H%M%S")
    );
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._- ".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Writes `bytes` to a temporary file next to `path` and renames it into
/// place, so readers never see a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Writes `bytes` under `dir` as `filename` without replacing an existing
/// file. Taken names get a `_1`, `_2`, ... suffix before the extension.
pub fn write_new(dir: &Path, filename: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;

    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (filename, String::new()),
    };
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = match attempt {
            0 => dir.join(filename),
            n => dir.join(format!("{stem}_{n}{ext}")),
        };
        match file.persist_noclobber(&path) {
            Ok(_) => return Ok(path),
            Err(PersistError { error, file: returned }) if error.kind() == io::ErrorKind::AlreadyExists => {
                file = returned;
            }
            Err(err) => return Err(err.error),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {filename} in {}", dir.display()),
    ))
}
