//! Small filesystem helpers shared by the stores.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::StoreError;

/// Replace `path` with `bytes` so that readers see either the old or the new
/// contents, never a partial file.
///
/// Writes to a sibling `.tmp` file, syncs it, then renames over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(StoreError::io(&tmp))?;
        file.write_all(bytes).map_err(StoreError::io(&tmp))?;
        file.sync_all().map_err(StoreError::io(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(StoreError::io(path))
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Delete a whole local state directory.
///
/// Used on shutdown when local state cleanup is enabled. A missing
/// directory is not an error.
pub fn remove_state_dir(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "Local state directory removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
