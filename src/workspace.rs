//! Module folder isolation.
//!
//! Terraform keeps `.terraform/` and local state next to the configuration,
//! so two scenarios applying the same example directory would trample each
//! other. Each scenario applies a private copy instead.

use crate::error::{HarnessError, Result};
use crate::state_store::DATA_DIR;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory names never copied
const SKIPPED_DIRS: &[&str] = &[".terraform", ".git", DATA_DIR];

/// File suffixes never copied
const SKIPPED_SUFFIXES: &[&str] = &[".tfstate", ".tfstate.backup", ".terraform.tfstate.lock.info"];

/// Marks the root of a module copy so it can be found and removed later
pub const COPY_MARKER: &str = ".stagecheck-copy";

fn should_skip_dir(name: &str) -> bool {
    SKIPPED_DIRS.contains(&name)
}

fn should_skip_file(name: &str) -> bool {
    name == COPY_MARKER || SKIPPED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Copy `root` into a fresh temporary directory and return the path of
/// `relative` inside the copy.
///
/// The whole root is copied so relative module sources such as
/// `../../modules/<name>` still resolve. The copy is kept on disk; its path
/// is persisted by `setup` and reused by replayed stages.
pub fn copy_module_to_temp(root: &Path, relative: &Path) -> Result<PathBuf> {
    let source = root.join(relative);
    if !source.is_dir() {
        return Err(HarnessError::config(format!(
            "Module directory {:?} does not exist",
            source
        )));
    }

    let prefix = relative
        .file_name()
        .map(|n| format!("{}-", n.to_string_lossy()))
        .unwrap_or_else(|| "module-".to_string());
    let dest_root = tempfile::Builder::new().prefix(&prefix).tempdir()?.keep();
    fs::write(dest_root.join(COPY_MARKER), root.to_string_lossy().as_bytes())?;

    let copied = copy_tree(root, &dest_root)?;
    info!("Copied {} files from {:?} to {:?}", copied, root, dest_root);

    Ok(dest_root.join(relative))
}

/// Remove the copy that `module_dir` lives in.
///
/// Only a directory carrying [`COPY_MARKER`] is removed. Returns false if
/// `module_dir` is not inside a module copy or the copy is already gone.
pub fn remove_module_copy(module_dir: &Path) -> Result<bool> {
    let Some(root) = module_dir
        .ancestors()
        .find(|dir| dir.join(COPY_MARKER).is_file())
    else {
        warn!("{:?} is not inside a module copy, leaving it in place", module_dir);
        return Ok(false);
    };

    fs::remove_dir_all(root)?;
    info!("Removed module copy {:?}", root);
    Ok(true)
}

/// Overwrite the top-level `.tf` files in `module_dir` with the ones in
/// `root/relative`, undoing any source rewrites left in the copy. Returns the
/// number of files written.
pub fn refresh_module_sources(root: &Path, relative: &Path, module_dir: &Path) -> Result<usize> {
    let source = root.join(relative);
    let mut refreshed = 0;
    for entry in fs::read_dir(&source)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "tf") {
            continue;
        }
        if let Some(name) = path.file_name() {
            fs::copy(&path, module_dir.join(name))?;
            refreshed += 1;
        }
    }
    debug!("Refreshed {} configuration files in {:?}", refreshed, module_dir);
    Ok(refreshed)
}

/// Recursively copy `src` into `dest`, skipping terraform working files.
/// Returns the number of files copied.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    let mut walker = walkdir::WalkDir::new(src).follow_links(false).into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            HarnessError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other(format!("filesystem loop under {:?}", src))
            }))
        })?;
        let name = entry.file_name().to_string_lossy();
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            if entry.depth() > 0 && should_skip_dir(&name) {
                debug!("Skipping {:?}", entry.path());
                walker.skip_current_dir();
                continue;
            }
            fs::create_dir_all(&target)?;
            continue;
        }

        if !entry.file_type().is_file() || should_skip_file(&name) {
            continue;
        }

        fs::copy(entry.path(), &target)?;
        copied += 1;
    }

    Ok(copied)
}
