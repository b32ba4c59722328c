use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nix::fcntl::{flock, FlockArg};

/// Proof that the store lock is held.  The lock is released when the guard is
/// dropped.
pub struct StoreGuard {
    _held : Box<dyn Send>
}

impl StoreGuard {
    pub fn new<T: Send + 'static>(held : T) -> StoreGuard {
        StoreGuard { _held : Box::new(held) }
    }
}

/// Mutual exclusion over the artifact store and the staging directory,
/// across processes
pub trait StoreLock : Send + Sync {
    /// Block until the lock is held
    fn acquire(&self) -> anyhow::Result<StoreGuard>;
}

/// An advisory `flock` on a well-known file
#[derive(Debug,Clone)]
pub struct FileLock {
    path : PathBuf
}

struct FlockHandle(File);

impl Drop for FlockHandle {
    fn drop(&mut self) {
        let _ = flock(self.0.as_raw_fd(), FlockArg::Unlock);
    }
}

impl FileLock {
    pub fn new(path : &Path) -> FileLock {
        FileLock { path : path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreLock for FileLock {
    fn acquire(&self) -> anyhow::Result<StoreGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A fresh descriptor per acquisition: flock locks belong to the open
        // file description, so sharing one would make the lock reentrant
        let f = OpenOptions::new().create(true).write(true).open(&self.path)?;
        if flock(f.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
            info!("Waiting for lock {:?}", self.path);
            flock(f.as_raw_fd(), FlockArg::LockExclusive)?;
        }
        debug!("Acquired lock {:?}", self.path);
        Ok(StoreGuard::new(FlockHandle(f)))
    }
}
