//! Small filesystem helpers shared by both storage engines.

use std::path::Path;

/// Demotes a sealed backing file to read-only permissions.
pub(crate) fn set_readonly(path: &Path) -> std::io::Result<()> {
    let mut perms = fs_err::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs_err::set_permissions(path, perms)
}

/// Lifts read-only permissions for an in-place rewrite, returning the
/// original permissions to restore afterwards (or `None` if the file was
/// already writable).
pub(crate) fn make_writable(path: &Path) -> std::io::Result<Option<std::fs::Permissions>> {
    let perms = fs_err::metadata(path)?.permissions();
    if !perms.readonly() {
        return Ok(None);
    }
    let mut writable = perms.clone();
    #[allow(clippy::permissions_set_readonly_false)]
    writable.set_readonly(false);
    fs_err::set_permissions(path, writable)?;
    Ok(Some(perms))
}

/// Restores permissions saved by [`make_writable`], logging instead of
/// failing: the rewrite itself already succeeded or already has an error to
/// report.
pub(crate) fn restore_permissions(path: &Path, perms: Option<std::fs::Permissions>) {
    if let Some(perms) = perms {
        if let Err(e) = fs_err::set_permissions(path, perms) {
            tracing::warn!("failed to restore permissions on '{}': {e}", path.display());
        }
    }
}

/// Removes a file, logging anything other than "already gone".
pub(crate) fn remove_quiet(path: &Path) {
    if let Err(e) = fs_err::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove '{}': {e}", path.display());
        }
    }
}
