// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{mismatched_descriptor, Attachment, BackendKind, SegmentBackend, SegmentDescriptor};
use crate::error::ShmError;
use crate::key::{self, SegmentKey};
use libc::off_t;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

/// Segments living in the POSIX shared memory namespace (`/dev/shm` on
/// Linux), named by [`SegmentKey::Name`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PosixBackend;

/// Resolves a key to the name handed to `shm_open`.
fn shm_path(key: &SegmentKey) -> Result<CString, ShmError> {
    let SegmentKey::Name(name) = key else {
        return Err(ShmError::invalid_key(
            format!("POSIX shared memory needs a name key, got token {key}"),
            Errno::EINVAL,
        ));
    };
    if name.is_empty() || name.contains('/') {
        return Err(ShmError::invalid_key(
            format!("\"{name}\" is not a valid shared memory name"),
            Errno::EINVAL,
        ));
    }
    CString::new(format!("/{name}")).map_err(|_| {
        ShmError::invalid_key(
            format!("shared memory name {name:?} contains a NUL byte"),
            Errno::EINVAL,
        )
    })
}

fn io_errno(err: &io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}

fn mmap_fd<F: AsFd>(fd: F, len: usize, hint: Option<NonNull<u8>>) -> nix::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
    let addr = hint.and_then(|hint| NonZeroUsize::new(hint.as_ptr() as usize));
    // SAFETY: a shared mapping of a descriptor we own; without MAP_FIXED the
    // hint cannot clobber an existing mapping.
    let base = unsafe {
        mmap(
            addr,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )?
    };
    Ok(base.cast())
}

impl PosixBackend {
    #[cfg(target_os = "linux")]
    fn probe(&self, path: &CString) -> Result<bool, ShmError> {
        // glibc backs shm_open names with files in /dev/shm.
        let name = path.to_string_lossy();
        let file = std::path::Path::new("/dev/shm").join(name.trim_start_matches('/'));
        file.try_exists().map_err(|err| {
            ShmError::bad_alloc(
                format!("failed to probe {}", file.display()),
                io_errno(&err),
            )
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn probe(&self, path: &CString) -> Result<bool, ShmError> {
        match shm_open(path.as_c_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(_) | Err(Errno::EACCES) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(errno) => Err(ShmError::bad_alloc(
                format!("failed to probe shared memory {path:?}"),
                errno,
            )),
        }
    }
}

impl SegmentBackend for PosixBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Posix
    }

    fn generate_key(&self, max_length: usize, _project_id: i32) -> Result<SegmentKey, ShmError> {
        key::random_name(max_length)
    }

    fn exists(&self, key: &SegmentKey) -> Result<bool, ShmError> {
        self.probe(&shm_path(key)?)
    }

    fn create_exclusive(
        &self,
        key: &SegmentKey,
        alloc_bytes: usize,
    ) -> Result<SegmentDescriptor, ShmError> {
        let path = shm_path(key)?;
        let fd = shm_open(
            path.as_c_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| match errno {
            Errno::EEXIST => ShmError::AlreadyExists {
                key: key.to_string(),
            },
            errno => ShmError::bad_alloc(format!("failed to open shared memory \"{key}\""), errno),
        })?;

        let truncated = off_t::try_from(alloc_bytes)
            .map_err(|_| Errno::EFBIG)
            .and_then(|len| ftruncate(&fd, len));
        if let Err(errno) = truncated {
            if let Err(err) = shm_unlink(path.as_c_str()) {
                tracing::warn!(%key, "failed to unlink shared memory after a failed truncate: {err}");
            }
            return Err(ShmError::bad_alloc(
                format!("failed to truncate shared memory \"{key}\" to {alloc_bytes} bytes"),
                errno,
            ));
        }

        tracing::debug!(%key, alloc_bytes, "created POSIX shared memory object");
        Ok(SegmentDescriptor::Fd(fd))
    }

    fn map(
        &self,
        descriptor: &SegmentDescriptor,
        alloc_bytes: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, Errno> {
        match descriptor {
            SegmentDescriptor::Fd(fd) => mmap_fd(fd, alloc_bytes, hint),
            SegmentDescriptor::ShmId(_) => Err(mismatched_descriptor(self.kind())),
        }
    }

    fn attach(&self, key: &SegmentKey) -> Result<Attachment, ShmError> {
        let path = shm_path(key)?;
        let fd = shm_open(path.as_c_str(), OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
            match errno {
                Errno::ENOENT => ShmError::NotFound {
                    key: key.to_string(),
                    errno,
                },
                errno => ShmError::bad_alloc(
                    format!("failed to open shared memory with key \"{key}\""),
                    errno,
                ),
            }
        })?;
        let file = File::from(fd);
        let len = file
            .metadata()
            .map_err(|err| {
                ShmError::bad_alloc(
                    format!("failed to stat shared memory \"{key}\""),
                    io_errno(&err),
                )
            })
            .and_then(|meta| {
                usize::try_from(meta.len()).map_err(|_| {
                    ShmError::bad_alloc(
                        format!("shared memory \"{key}\" is too large to map"),
                        Errno::EOVERFLOW,
                    )
                })
            })?;

        let base = mmap_fd(&file, len, None).map_err(|errno| {
            ShmError::bad_alloc(
                format!("failed to mmap shared memory \"{key}\" of {len} bytes"),
                errno,
            )
        })?;

        tracing::debug!(%key, len, "attached POSIX shared memory object");
        Ok(Attachment {
            base,
            len,
            descriptor: SegmentDescriptor::Fd(OwnedFd::from(file)),
        })
    }

    unsafe fn detach(&self, base: NonNull<u8>, len: usize) -> Result<(), Errno> {
        munmap(base.cast(), len)
    }

    fn unlink(&self, key: &SegmentKey) -> Result<(), ShmError> {
        let path = shm_path(key)?;
        shm_unlink(path.as_c_str()).map_err(|errno| match errno {
            Errno::ENOENT => ShmError::invalid_key(
                format!("shared memory \"{key}\" to unlink does not exist"),
                errno,
            ),
            errno => ShmError::invalid_key(
                format!("failed to unlink shared memory \"{key}\""),
                errno,
            ),
        })?;
        tracing::debug!(%key, "unlinked POSIX shared memory object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShmErrorKind;

    #[test]
    fn names_resolve_to_rooted_paths() {
        assert_eq!(
            c"/demo",
            shm_path(&SegmentKey::name("demo")).unwrap().as_c_str()
        );
    }

    #[test]
    fn bad_names_are_invalid_keys() {
        for key in [
            SegmentKey::name(""),
            SegmentKey::name("a/b"),
            SegmentKey::name("a\0b"),
            SegmentKey::Token(7),
        ] {
            let err = shm_path(&key).unwrap_err();
            assert_eq!(ShmErrorKind::InvalidKey, err.kind(), "{key:?}");
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn zero_length_map_is_rejected() {
        let key = PosixBackend.generate_key(32, 0).unwrap();
        let descriptor = PosixBackend.create_exclusive(&key, 0).unwrap();
        assert_eq!(
            Err(Errno::EINVAL),
            PosixBackend.map(&descriptor, 0, None)
        );
        let attached = PosixBackend.attach(&key).unwrap_err();
        assert_eq!(ShmErrorKind::BadAlloc, attached.kind());
        assert_eq!(libc::EINVAL, attached.os_code());
        PosixBackend.unlink(&key).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn unlink_missing_is_invalid_key() {
        let key = PosixBackend.generate_key(32, 0).unwrap();
        let err = PosixBackend.unlink(&key).unwrap_err();
        assert_eq!(ShmErrorKind::InvalidKey, err.kind());
        assert_eq!(libc::ENOENT, err.os_code());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn create_probe_attach_unlink() {
        let key = PosixBackend.generate_key(32, 0).unwrap();
        let page = crate::sizing::page_size();
        assert!(!PosixBackend.exists(&key).unwrap());

        let descriptor = PosixBackend.create_exclusive(&key, 2 * page).unwrap();
        assert!(PosixBackend.exists(&key).unwrap());
        let err = PosixBackend.create_exclusive(&key, 2 * page).unwrap_err();
        assert_eq!(ShmErrorKind::AlreadyExists, err.kind());

        let base = PosixBackend.map(&descriptor, 2 * page, None).unwrap();
        let attached = PosixBackend.attach(&key).unwrap();
        assert_eq!(2 * page, attached.len);

        unsafe {
            base.as_ptr().write(0x5a);
            assert_eq!(0x5a, attached.base.as_ptr().read());
            PosixBackend.detach(base, 2 * page).unwrap();
            PosixBackend.detach(attached.base, attached.len).unwrap();
        }
        PosixBackend.unlink(&key).unwrap();
        assert!(!PosixBackend.exists(&key).unwrap());
    }
}
