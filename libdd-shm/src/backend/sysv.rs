// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{mismatched_descriptor, Attachment, BackendKind, SegmentBackend, SegmentDescriptor};
use crate::error::ShmError;
use crate::key::SegmentKey;
use nix::errno::Errno;
use std::ffi::CString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::ptr::{self, NonNull};

/// System V segments, keyed by [`SegmentKey::Token`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SysvBackend;

/// Derives a token from the current working directory and `project_id` with
/// `ftok`. The same directory and id always produce the same token. Falls
/// back to `/` when the working directory cannot be read.
pub fn path_token(project_id: i32) -> Result<SegmentKey, ShmError> {
    let dir = std::env::current_dir().unwrap_or_else(|err| {
        tracing::warn!("failed to get the working directory ({err}), using / instead");
        PathBuf::from("/")
    });
    let display = dir.display().to_string();
    let path = CString::new(dir.into_os_string().into_vec()).map_err(|_| {
        ShmError::invalid_key(
            format!("working directory {display} contains a NUL byte"),
            Errno::EINVAL,
        )
    })?;
    // SAFETY: path is a valid C string.
    let token = unsafe { libc::ftok(path.as_ptr(), project_id) };
    if token == -1 {
        return Err(ShmError::invalid_key(
            format!("failed to derive a key from {display} and project id {project_id}"),
            Errno::last(),
        ));
    }
    Ok(SegmentKey::Token(token))
}

fn token(key: &SegmentKey) -> Result<libc::key_t, ShmError> {
    match key {
        SegmentKey::Token(libc::IPC_PRIVATE) => Err(ShmError::invalid_key(
            "IPC_PRIVATE cannot name a shared segment",
            Errno::EINVAL,
        )),
        SegmentKey::Token(token) => Ok(*token),
        SegmentKey::Name(name) => Err(ShmError::invalid_key(
            format!("System V shared memory needs a token key, got name \"{name}\""),
            Errno::EINVAL,
        )),
    }
}

fn lookup(token: libc::key_t) -> Result<libc::c_int, Errno> {
    // SAFETY: size 0 and no flags only look the segment up.
    match unsafe { libc::shmget(token, 0, 0) } {
        -1 => Err(Errno::last()),
        id => Ok(id),
    }
}

fn shmat(id: libc::c_int, hint: Option<NonNull<u8>>) -> Result<NonNull<u8>, Errno> {
    let addr = hint.map_or(ptr::null(), |hint| hint.as_ptr().cast_const().cast());
    // SAFETY: without SHM_REMAP the kernel refuses to clobber an existing
    // mapping at the hint.
    let out = unsafe { libc::shmat(id, addr, 0) };
    if out as isize == -1 {
        return Err(Errno::last());
    }
    NonNull::new(out.cast()).ok_or(Errno::EFAULT)
}

impl SegmentBackend for SysvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SystemV
    }

    fn generate_key(&self, _max_length: usize, project_id: i32) -> Result<SegmentKey, ShmError> {
        path_token(project_id)
    }

    fn exists(&self, key: &SegmentKey) -> Result<bool, ShmError> {
        match lookup(token(key)?) {
            Ok(_) | Err(Errno::EACCES) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(errno) => Err(ShmError::bad_alloc(
                format!("failed to probe shared memory {key}"),
                errno,
            )),
        }
    }

    fn create_exclusive(
        &self,
        key: &SegmentKey,
        alloc_bytes: usize,
    ) -> Result<SegmentDescriptor, ShmError> {
        let token = token(key)?;
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | 0o600;
        // SAFETY: plain syscall, no pointers involved.
        let id = unsafe { libc::shmget(token, alloc_bytes, flags) };
        if id == -1 {
            return Err(match Errno::last() {
                Errno::EEXIST => ShmError::AlreadyExists {
                    key: key.to_string(),
                },
                errno => ShmError::bad_alloc(
                    format!("failed to create shared memory {key} with {alloc_bytes} bytes"),
                    errno,
                ),
            });
        }
        tracing::debug!(%key, id, alloc_bytes, "created System V shared memory segment");
        Ok(SegmentDescriptor::ShmId(id))
    }

    fn map(
        &self,
        descriptor: &SegmentDescriptor,
        _alloc_bytes: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, Errno> {
        match descriptor {
            SegmentDescriptor::ShmId(id) => shmat(*id, hint),
            SegmentDescriptor::Fd(_) => Err(mismatched_descriptor(self.kind())),
        }
    }

    fn attach(&self, key: &SegmentKey) -> Result<Attachment, ShmError> {
        let id = lookup(token(key)?).map_err(|errno| match errno {
            Errno::ENOENT => ShmError::NotFound {
                key: key.to_string(),
                errno,
            },
            errno => ShmError::bad_alloc(
                format!("failed to look up shared memory with key {key}"),
                errno,
            ),
        })?;

        // SAFETY: shmid_ds is plain old data.
        let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
        // SAFETY: stat is a valid, writable shmid_ds.
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut stat) } == -1 {
            return Err(ShmError::bad_alloc(
                format!("failed to stat shared memory {key}"),
                Errno::last(),
            ));
        }
        let len = stat.shm_segsz as usize;

        let base = shmat(id, None).map_err(|errno| {
            ShmError::bad_alloc(
                format!("failed to attach shared memory {key} of {len} bytes"),
                errno,
            )
        })?;

        tracing::debug!(%key, id, len, "attached System V shared memory segment");
        Ok(Attachment {
            base,
            len,
            descriptor: SegmentDescriptor::ShmId(id),
        })
    }

    unsafe fn detach(&self, base: NonNull<u8>, _len: usize) -> Result<(), Errno> {
        match libc::shmdt(base.as_ptr().cast_const().cast()) {
            0 => Ok(()),
            _ => Err(Errno::last()),
        }
    }

    fn unlink(&self, key: &SegmentKey) -> Result<(), ShmError> {
        let id = lookup(token(key)?).map_err(|errno| match errno {
            Errno::ENOENT => ShmError::invalid_key(
                format!("shared memory {key} to remove does not exist"),
                errno,
            ),
            errno => ShmError::invalid_key(format!("failed to look up shared memory {key}"), errno),
        })?;
        // SAFETY: IPC_RMID ignores the buffer argument.
        if unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
            return Err(ShmError::invalid_key(
                format!("failed to remove shared memory {key}"),
                Errno::last(),
            ));
        }
        tracing::debug!(%key, id, "removed System V shared memory segment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShmErrorKind;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn tokens_are_deterministic() {
        assert_eq!(path_token(42).unwrap(), path_token(42).unwrap());
        assert_ne!(path_token(42).unwrap(), path_token(43).unwrap());
    }

    #[test]
    fn name_keys_are_rejected() {
        let err = SysvBackend.exists(&SegmentKey::name("demo")).unwrap_err();
        assert_eq!(ShmErrorKind::InvalidKey, err.kind());
        let err = SysvBackend
            .unlink(&SegmentKey::Token(libc::IPC_PRIVATE))
            .unwrap_err();
        assert_eq!(ShmErrorKind::InvalidKey, err.kind());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn create_attach_remove() {
        let key = path_token(0x51).unwrap();
        // Clear anything a crashed run left behind.
        _ = SysvBackend.unlink(&key);

        let page = crate::sizing::page_size();
        let descriptor = SysvBackend.create_exclusive(&key, 2 * page).unwrap();
        assert!(SysvBackend.exists(&key).unwrap());
        let err = SysvBackend.create_exclusive(&key, 2 * page).unwrap_err();
        assert_eq!(ShmErrorKind::AlreadyExists, err.kind());

        let base = SysvBackend.map(&descriptor, 2 * page, None).unwrap();
        let attached = SysvBackend.attach(&key).unwrap();
        assert_eq!(2 * page, attached.len);
        unsafe {
            base.as_ptr().add(page).write(0x17);
            assert_eq!(0x17, attached.base.as_ptr().add(page).read());
        }

        SysvBackend.unlink(&key).unwrap();
        assert!(!SysvBackend.exists(&key).unwrap());
        unsafe {
            SysvBackend.detach(base, 2 * page).unwrap();
            SysvBackend.detach(attached.base, attached.len).unwrap();
        }
    }
}
