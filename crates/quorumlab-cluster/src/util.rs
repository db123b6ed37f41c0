//! Filesystem and endpoint helpers.

use std::fs;
use std::io;
use std::path::Path;

#[cfg(unix)]
const PRIVATE_FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const PRIVATE_DIR_MODE: u32 = 0o700;

/// Create `dir` and its parents with owner-only permissions, then verify
/// it is writable.
pub fn mkdir_all(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(PRIVATE_DIR_MODE);
    }
    builder.create(dir)?;
    dir_writable(dir)
}

/// Write and remove a marker file in `dir`.
pub fn dir_writable(dir: &Path) -> io::Result<()> {
    let marker = dir.join(".touch");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_FILE_MODE);
    }
    drop(options.open(&marker)?);
    fs::remove_file(&marker)
}

/// Remove `dir` recursively; a missing directory is not an error.
pub fn remove_dir_all(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// The `host:port` part of an endpoint given either bare or as a URL.
pub fn get_host(endpoint: &str) -> &str {
    match endpoint.split_once("://") {
        Some((_, rest)) => rest.split(['/', '?', '#']).next().unwrap_or(rest),
        None => endpoint,
    }
}
