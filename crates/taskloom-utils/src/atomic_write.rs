//! Atomic file writes with cross-platform support
//!
//! Every persistent record taskloom owns (skeletons, commit entries, state
//! files, messages) is written through this module. The write happens in
//! two steps: the content is staged into a temporary file that is flushed
//! to disk, then the staged file is promoted over the target in a single
//! rename. A crash never leaves a half-written JSON file where a reader
//! expects a whole one.

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io::{self, Write};

use tempfile::NamedTempFile;

/// Atomically write UTF-8 content to a file.
///
/// The staging file is created in the target's parent directory so the
/// promoting rename normally stays on one filesystem; when the rename still
/// crosses mounts, the bytes are landed beside the target and renamed from
/// there. Content is written exactly as given: no BOM, no line-ending
/// rewriting.
pub fn write_file_atomic(path: &Utf8Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(dir.as_std_path())
        .with_context(|| format!("Failed to create parent directory: {dir}"))?;

    let staged = stage(dir, content)?;
    promote(staged, path).with_context(|| format!("Failed to atomically write file: {path}"))
}

/// Write `content` into a fresh temporary file under `dir` and flush it to
/// disk, so the later rename publishes fully durable bytes.
fn stage(dir: &Utf8Path, content: &str) -> Result<NamedTempFile> {
    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create staging file in: {dir}"))?;
    staged
        .write_all(content.as_bytes())
        .with_context(|| "Failed to write staged content")?;
    staged
        .as_file()
        .sync_all()
        .with_context(|| "Failed to flush staged content")?;
    Ok(staged)
}

/// Whether a failed rename crossed a filesystem boundary.
fn is_cross_device(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices
}

/// Promote the staged file over the target.
///
/// Windows only: antivirus scanners and indexers briefly hold fresh files
/// open, so a rename can fail with a transient sharing violation. Walk a
/// short fixed ladder of pauses before giving up; the total wait stays
/// under a quarter second.
#[cfg(windows)]
fn promote(staged: NamedTempFile, target: &Utf8Path) -> Result<()> {
    const PAUSE_LADDER_MS: &[u64] = &[5, 15, 45, 120];

    let mut staged = staged;
    let mut pauses = PAUSE_LADDER_MS.iter();
    loop {
        let failure = match staged.persist(target.as_std_path()) {
            Ok(_) => return Ok(()),
            Err(failure) => failure,
        };
        if is_cross_device(&failure.error) {
            return land_beside_target(failure.file, target);
        }
        let transient = failure.error.kind() == io::ErrorKind::PermissionDenied;
        match pauses.next() {
            Some(pause) if transient => {
                std::thread::sleep(std::time::Duration::from_millis(*pause));
                staged = failure.file;
            }
            _ => return Err(anyhow::Error::from(failure.error)),
        }
    }
}

#[cfg(not(windows))]
fn promote(staged: NamedTempFile, target: &Utf8Path) -> Result<()> {
    match staged.persist(target.as_std_path()) {
        Ok(_) => Ok(()),
        Err(failure) if is_cross_device(&failure.error) => {
            land_beside_target(failure.file, target)
        }
        Err(failure) => Err(anyhow::Error::from(failure.error)),
    }
}

/// Cross-mount fallback: copy the staged bytes into a sibling of the
/// target, flush, and rename within the target's own filesystem. The
/// sibling name carries the process id so concurrent writers never collide.
fn land_beside_target(staged: NamedTempFile, target: &Utf8Path) -> Result<()> {
    let Some(file_name) = target.file_name() else {
        bail!("Target has no file name: {target}");
    };
    let sibling: Utf8PathBuf =
        target.with_file_name(format!("{file_name}.{}.staging", std::process::id()));

    let bytes = fs::read(staged.path())
        .with_context(|| "Failed to read staged content for cross-mount landing")?;
    let landed = fs::write(sibling.as_std_path(), &bytes)
        .with_context(|| format!("Failed to land staged content at: {sibling}"))
        .and_then(|()| {
            fs::File::open(sibling.as_std_path())
                .and_then(|f| f.sync_all())
                .with_context(|| format!("Failed to flush landed content at: {sibling}"))
        })
        .and_then(|()| {
            fs::rename(sibling.as_std_path(), target.as_std_path())
                .with_context(|| format!("Failed to promote landed content to: {target}"))
        });

    if landed.is_err() {
        let _ = fs::remove_file(sibling.as_std_path());
    }
    landed
}
