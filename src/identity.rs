//! Host-wide persistent UUIDs with advisory file locking.
//!
//! Each logical (prefix, role) pair owns a canonical UUID persisted under
//! the store's UUID root, guarded by an exclusive advisory lock under the
//! lock root. The first instance of a role on a host takes the lock and
//! the canonical UUID; further concurrent instances get a fresh random
//! UUID with no lock, so auxiliary instances stay distinguishable without
//! blocking while exactly one instance is canonical.
//!
//! The lock is non-blocking by design: availability wins over uniqueness.
//! A [`LockedUuid`] releases its lock on drop, and an explicit
//! [`IdentityStore::release`] is a no-op for unlocked values.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, SsntpError};

/// Default root for persisted UUIDs.
pub const DEFAULT_UUID_ROOT: &str = "/var/lib/ssntp/uuid-storage/role";

/// Default root for UUID lock files.
pub const DEFAULT_LOCK_ROOT: &str = "/tmp/lock/ssntp";

/// Length of a canonical hyphenated UUID string.
const UUID_TEXT_LEN: usize = 36;

/// A UUID handed out by the identity store, optionally holding the
/// canonical slot's advisory lock.
#[derive(Debug)]
pub struct LockedUuid {
    uuid: Uuid,
    lock: Option<File>,
}

impl LockedUuid {
    /// The UUID value.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether this instance holds the canonical slot for its (prefix,
    /// role) pair.
    pub fn is_canonical(&self) -> bool {
        self.lock.is_some()
    }

    fn unlock(&mut self) {
        if let Some(lock) = self.lock.take() {
            let ret = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_UN) };
            if ret != 0 {
                warn!("failed to unlock UUID: {}", std::io::Error::last_os_error());
            }
        }
    }
}

impl Drop for LockedUuid {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Filesystem-backed store for per-role endpoint identities.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    uuid_root: PathBuf,
    lock_root: PathBuf,
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new(DEFAULT_UUID_ROOT, DEFAULT_LOCK_ROOT)
    }
}

impl IdentityStore {
    /// Create a store over custom roots.
    pub fn new(uuid_root: impl Into<PathBuf>, lock_root: impl Into<PathBuf>) -> Self {
        Self {
            uuid_root: uuid_root.into(),
            lock_root: lock_root.into(),
        }
    }

    /// Acquire a UUID for the (prefix, role) pair.
    ///
    /// Takes a non-blocking exclusive advisory lock on the pair's lock
    /// file. With the lock held, the persisted UUID is returned (a fresh
    /// one is generated and written if the file is empty or malformed) and
    /// the lock stays held for the lifetime of the returned value. When
    /// another process already holds the lock, a fresh random UUID is
    /// returned with no lock.
    pub fn acquire(&self, prefix: &str, role: u32) -> Result<LockedUuid> {
        let uuid_dir = self.uuid_root.join(prefix);
        let uuid_file = uuid_dir.join(format!("{:#x}", role));
        let lock_file = self.lock_root.join(format!("{}-role-{:#x}", prefix, role));

        fs::create_dir_all(&uuid_dir)
            .map_err(|e| SsntpError::Identity(format!("create {:?}: {}", uuid_dir, e)))?;
        fs::create_dir_all(&self.lock_root)
            .map_err(|e| SsntpError::Identity(format!("create {:?}: {}", self.lock_root, e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&uuid_file)
            .map_err(|e| SsntpError::Identity(format!("open {:?}: {}", uuid_file, e)))?;

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_file)
            .map_err(|e| SsntpError::Identity(format!("open {:?}: {}", lock_file, e)))?;

        let ret = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            // Another instance holds the canonical slot; stay live with a
            // random identity. The lock file descriptor closes on drop.
            return Ok(LockedUuid {
                uuid: Uuid::new_v4(),
                lock: None,
            });
        }

        // From here the lock is held; any early return hands it to the
        // LockedUuid or drops the File, which closes the descriptor and
        // releases the lock with it.
        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(|e| SsntpError::Identity(format!("read {:?}: {}", uuid_file, e)))?;

        let uuid = if text.len() == UUID_TEXT_LEN {
            match Uuid::parse_str(&text) {
                Ok(uuid) => uuid,
                Err(_) => self.rewrite(&mut file, &uuid_file)?,
            }
        } else {
            // Either just created, or holding garbage. Overwrite.
            self.rewrite(&mut file, &uuid_file)?
        };

        Ok(LockedUuid {
            uuid,
            lock: Some(lock),
        })
    }

    /// Release a previously acquired UUID, dropping the advisory lock if
    /// one is held. Releasing an unlocked value is a no-op.
    pub fn release(&self, mut locked: LockedUuid) {
        locked.unlock();
    }

    fn rewrite(&self, file: &mut File, path: &PathBuf) -> Result<Uuid> {
        let uuid = Uuid::new_v4();
        file.set_len(0)
            .and_then(|_| {
                use std::io::Seek;
                file.seek(std::io::SeekFrom::Start(0))?;
                file.write_all(uuid.to_string().as_bytes())
            })
            .map_err(|e| SsntpError::Identity(format!("write {:?}: {}", path, e)))?;
        Ok(uuid)
    }
}
