//! POSIX named shared memory, mapped read-write.
//!
//! `SharedMemory` wraps `shm_open` + `ftruncate` + `mmap` behind the same
//! thin file-handle-plus-mmap shape the rest of the fabric expects: a raw
//! pointer and a length, with the OS object kept alive for as long as the
//! mapping is. Unlike a plain `mmap`'d file, a POSIX shared memory object
//! has no path on any filesystem a user browses — it is named (`/ktsnd_*`)
//! and looked up through `shm_open`, so the sender and the shim can find
//! the same region without coordinating a path.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::FromRawFd;

use memmap2::MmapMut;

mod name;
pub use name::ShmName;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shared memory name '{0}' is not valid (must start with '/' and contain no other '/')")]
    InvalidName(String),

    #[error("shm_open({name}) failed: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ftruncate({name}, {size}) failed: {source}")]
    Truncate {
        name: String,
        size: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("mmap({name}) failed: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A mapped POSIX shared memory object.
///
/// Created with [`SharedMemory::create`] (fails if the object already
/// exists — exactly one process, the sender, creates the arena) or attached
/// with [`SharedMemory::attach`] (fails if the object does not exist yet —
/// the shim attaches to an arena the sender already created).
pub struct SharedMemory {
    name: ShmName,
    owner: bool,
    _file: File,
    mmap: MmapMut,
}

impl SharedMemory {
    /// Creates a new shared memory object of exactly `size` bytes.
    ///
    /// Fails with [`ShmError::Open`] if an object with this name already
    /// exists — there is exactly one creator per arena (the sender).
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        let shm_name = ShmName::parse(name)?;
        let cname = shm_name.as_cstring();

        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::Open {
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        // SAFETY: fd is a freshly opened, valid, owned file descriptor.
        let file = unsafe { File::from_raw_fd(fd) };
        if let Err(source) = file.set_len(size as u64) {
            let _ = unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(ShmError::Truncate {
                name: name.to_string(),
                size: size as u64,
                source,
            });
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })?;

        Ok(SharedMemory {
            name: shm_name,
            owner: true,
            _file: file,
            mmap,
        })
    }

    /// Attaches to an existing shared memory object of exactly `size` bytes.
    ///
    /// Fails with [`ShmError::Open`] if no object with this name exists yet
    /// — the caller (typically the shim) should fail fast rather than
    /// retry indefinitely, per §4.5: "fail fast if absent".
    pub fn attach(name: &str, size: usize) -> Result<Self, ShmError> {
        let shm_name = ShmName::parse(name)?;
        let cname = shm_name.as_cstring();

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::Open {
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        let file = unsafe { File::from_raw_fd(fd) };
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })?;

        Ok(SharedMemory {
            name: shm_name,
            owner: false,
            _file: file,
            mmap,
        })
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Tears the arena down: unmaps (via `Drop`) and unlinks the shared
    /// memory object from the filesystem namespace so no further process
    /// can attach to it.
    ///
    /// Only the creator should call this — the sender owns the arena
    /// lifecycle (§9 Design Notes: "Teardown on process exit is
    /// best-effort — the sender owns the arena lifecycle").
    pub fn destroy(self) {
        let owner = self.owner;
        let cname = self.name.as_cstring();
        drop(self);
        if owner {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_name(tag: &str) -> String {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/ktsn_mmap_test_{tag}_{nanos}")
    }

    #[test]
    fn create_then_attach_round_trips_bytes() {
        let name = unique_name("roundtrip");

        let mut writer = SharedMemory::create(&name, 4096).unwrap();
        unsafe {
            let p = writer.as_mut_ptr();
            *p.add(0) = 0xAB;
            *p.add(1) = 0xCD;
        }

        let reader = SharedMemory::attach(&name, 4096).unwrap();
        unsafe {
            let p = reader.as_ptr();
            assert_eq!(*p.add(0), 0xAB);
            assert_eq!(*p.add(1), 0xCD);
        }

        writer.destroy();
    }

    #[test]
    fn create_twice_fails() {
        let name = unique_name("double_create");
        let first = SharedMemory::create(&name, 4096).unwrap();
        let second = SharedMemory::create(&name, 4096);
        assert!(second.is_err());
        first.destroy();
    }

    #[test]
    fn attach_without_create_fails() {
        let name = unique_name("missing");
        assert!(SharedMemory::attach(&name, 4096).is_err());
    }

    #[test]
    fn bare_name_with_no_leading_slash_is_normalised_not_rejected() {
        let name = unique_name("bare");
        let bare = name.trim_start_matches('/');
        let shm = SharedMemory::create(bare, 4096).unwrap();
        shm.destroy();
    }

    #[test]
    fn embedded_slash_is_rejected() {
        assert!(SharedMemory::create("a/b", 4096).is_err());
    }
}
