//! Small filesystem helpers shared by the ledger and the artifact store.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use varnika_shared::{Result, VarnikaError};

/// Write `content` to `path` via a temp file in the same directory and a rename,
/// so readers see either the old or the new file, never a partial one.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| VarnikaError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| VarnikaError::io(dir, e))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| VarnikaError::io(tmp.path(), e))?;
    tmp.as_file_mut()
        .sync_all()
        .map_err(|e| VarnikaError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| VarnikaError::io(path, e.error))?;
    Ok(())
}

/// Read a file, treating a missing file as empty.
pub fn read_or_empty(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(VarnikaError::io(path, e)),
    }
}
