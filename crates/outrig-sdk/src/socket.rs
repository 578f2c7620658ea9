//! PID-tagged advisory lock guarding a plugin's Unix socket path.
//!
//! The lock file sits next to the socket (`<socket>.lock`) and holds the
//! owner's PID in decimal. A lock whose PID is unreadable or no longer alive
//! is stale and gets reclaimed; a live owner means the path is refused.
//! The file is staged under a temporary name and linked into place, so it is
//! never observed without its PID.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("socket {} is in use by live process {pid}", path.display())]
    InUse { path: PathBuf, pid: u32 },
    #[error("failed to manage socket lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Holds the socket path for the lifetime of the runtime; removes both files on drop.
#[derive(Debug)]
pub struct SocketLock {
    socket_path: PathBuf,
    lock_path: PathBuf,
    pid: u32,
}

pub fn socket_path_for(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("outrig-{id}.sock"))
}

pub fn lock_path_for(socket_path: &Path) -> PathBuf {
    let mut raw = socket_path.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

impl SocketLock {
    pub fn acquire(socket_path: PathBuf) -> Result<Self, LockError> {
        Self::acquire_as(socket_path, std::process::id())
    }

    fn acquire_as(socket_path: PathBuf, pid: u32) -> Result<Self, LockError> {
        let lock_path = lock_path_for(&socket_path);
        let io_err = |source| LockError::Io {
            path: lock_path.clone(),
            source,
        };

        for _ in 0..2 {
            match publish(&lock_path, pid) {
                Ok(()) => {
                    remove_if_exists(&socket_path).map_err(io_err)?;
                    return Ok(Self {
                        socket_path,
                        lock_path,
                        pid,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    match read_owner(&lock_path) {
                        Some(owner) if process_alive(owner) => {
                            return Err(LockError::InUse {
                                path: socket_path,
                                pid: owner,
                            });
                        }
                        owner => {
                            tracing::warn!(
                                lock = %lock_path.display(),
                                owner = ?owner,
                                "reclaiming stale socket lock"
                            );
                            remove_if_exists(&lock_path).map_err(io_err)?;
                            remove_if_exists(&socket_path).map_err(io_err)?;
                        }
                    }
                }
                Err(err) => return Err(io_err(err)),
            }
        }

        Err(io_err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "lock was re-created by another process while reclaiming it",
        )))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for SocketLock {
    fn drop(&mut self) {
        if let Err(err) = remove_if_exists(&self.socket_path) {
            tracing::warn!(socket = %self.socket_path.display(), error = %err, "failed to remove socket file");
        }
        if read_owner(&self.lock_path) == Some(self.pid) {
            if let Err(err) = remove_if_exists(&self.lock_path) {
                tracing::warn!(lock = %self.lock_path.display(), error = %err, "failed to remove socket lock");
            }
        }
    }
}

/// Writes `pid` to a sibling temp file and links it to `lock_path` without
/// replacing an existing lock (`AlreadyExists`).
fn publish(lock_path: &Path, pid: u32) -> io::Result<()> {
    let dir = match lock_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir)?;
    writeln!(staged, "{pid}")?;
    staged.flush()?;
    staged
        .persist_noclobber(lock_path)
        .map(drop)
        .map_err(|err| err.error)
}

fn read_owner(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// `kill(pid, 0)`: `EPERM` still proves the process exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEAD_PID: u32 = 999_999_999;

    #[test]
    fn lock_records_owner_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_path_for(dir.path(), "echo");
        let lock = SocketLock::acquire(socket.clone()).unwrap();

        assert_eq!(read_owner(lock.lock_path()), Some(std::process::id()));
        fs::write(&socket, b"").unwrap();
        drop(lock);

        assert!(!socket.exists());
        assert!(!lock_path_for(&socket).exists());
    }

    #[test]
    fn live_owner_refuses_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_path_for(dir.path(), "echo");
        let _held = SocketLock::acquire(socket.clone()).unwrap();

        match SocketLock::acquire(socket) {
            Err(LockError::InUse { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected InUse, got {other:?}"),
        }
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_path_for(dir.path(), "echo");
        fs::write(lock_path_for(&socket), format!("{DEAD_PID}\n")).unwrap();
        fs::write(&socket, b"stale").unwrap();

        let lock = SocketLock::acquire(socket.clone()).unwrap();
        assert_eq!(read_owner(lock.lock_path()), Some(std::process::id()));
        assert!(!socket.exists(), "stale socket file should be removed");
    }

    #[test]
    fn unreadable_lock_is_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_path_for(dir.path(), "echo");
        fs::write(lock_path_for(&socket), "not-a-pid").unwrap();
        assert!(SocketLock::acquire(socket).is_ok());
    }

    #[test]
    fn drop_leaves_a_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_path_for(dir.path(), "echo");
        let lock = SocketLock::acquire(socket.clone()).unwrap();
        fs::write(lock.lock_path(), "12345\n").unwrap();
        drop(lock);
        assert!(lock_path_for(&socket).exists());
    }

    #[test]
    fn concurrent_acquirers_leave_exactly_one_owner() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let socket = socket_path_for(dir.path(), "contended");
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let socket = socket.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    SocketLock::acquire(socket)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let owners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(owners, 1, "{results:?}");
        for result in &results {
            if let Err(err) = result {
                assert!(
                    matches!(err, LockError::InUse { pid, .. } if *pid == std::process::id()),
                    "{err:?}"
                );
            }
        }
        assert_eq!(read_owner(&lock_path_for(&socket)), Some(std::process::id()));

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "staged files must not linger: {leftovers:?}");
    }

    #[cfg(unix)]
    #[test]
    fn liveness_check_sees_this_process() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(DEAD_PID));
        assert!(!process_alive(0));
    }
}
