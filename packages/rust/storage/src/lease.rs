//! Advisory lease on a job database, held by every live job tracker.
//!
//! Each tracker holds a shared lock on a `<db>.lease` sidecar for as long as it
//! may run jobs. A tracker that manages to take the lock exclusively knows no
//! other tracker is alive, so every unfinished job in the database was left
//! behind by a dead process and may be failed.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use varnika_shared::{Result, VarnikaError};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct TrackerLease {
    file: File,
    path: PathBuf,
    sole: bool,
}

impl TrackerLease {
    /// Join the set of live trackers on the database at `db_path`.
    ///
    /// Waits up to `timeout` while another tracker is between acquiring the
    /// lease alone and sharing it.
    pub async fn acquire(db_path: &Path, timeout: Duration) -> Result<Self> {
        let path = lease_path(db_path);
        let file = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| VarnikaError::io(parent, e))?;
                }
                OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&path)
                    .map_err(|e| VarnikaError::io(&path, e))
            })
            .await
            .map_err(|e| VarnikaError::Storage(format!("lease task failed: {e}")))??
        };

        if FileExt::try_lock_exclusive(&file).is_ok() {
            debug!(path = %path.display(), "holding job database lease alone");
            return Ok(Self {
                file,
                path,
                sole: true,
            });
        }

        let start = Instant::now();
        loop {
            match FileExt::try_lock_shared(&file) {
                Ok(()) => {
                    debug!(path = %path.display(), "sharing job database lease");
                    return Ok(Self {
                        file,
                        path,
                        sole: false,
                    });
                }
                Err(e) if is_contended(&e) && start.elapsed() < timeout => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) if is_contended(&e) => {
                    return Err(VarnikaError::LockTimeout {
                        path,
                        waited_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "file locking unavailable, unfinished jobs will not be recovered"
                    );
                    return Ok(Self {
                        file,
                        path,
                        sole: false,
                    });
                }
            }
        }
    }

    /// Whether no other tracker was alive when this lease was taken.
    pub fn is_sole(&self) -> bool {
        self.sole
    }

    /// Downgrade a sole lease so other trackers can join.
    pub fn share(&mut self) {
        if !self.sole {
            return;
        }
        match FileExt::lock_shared(&self.file) {
            Ok(()) => self.sole = false,
            Err(e) => warn!(path = %self.path.display(), error = %e, "could not share job database lease"),
        }
    }
}

impl Drop for TrackerLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lease_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "jobs.db".into());
    name.push(".lease");
    db_path.with_file_name(name)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn first_holder_is_sole_until_it_shares() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("jobs.db");

        let mut first = TrackerLease::acquire(&db, WAIT).await.expect("first");
        assert!(first.is_sole());

        // A sole holder keeps others out until it shares.
        let blocked = TrackerLease::acquire(&db, WAIT).await.unwrap_err();
        assert!(matches!(blocked, VarnikaError::LockTimeout { .. }));

        first.share();
        assert!(!first.is_sole());
        let second = TrackerLease::acquire(&db, WAIT).await.expect("second");
        assert!(!second.is_sole());
    }

    #[tokio::test]
    async fn lease_frees_up_when_every_holder_is_gone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("jobs.db");

        let mut first = TrackerLease::acquire(&db, WAIT).await.expect("first");
        first.share();
        let second = TrackerLease::acquire(&db, WAIT).await.expect("second");
        drop(first);
        drop(second);

        let third = TrackerLease::acquire(&db, WAIT).await.expect("third");
        assert!(third.is_sole());
        assert!(dir.path().join("jobs.db.lease").exists());
    }
}
