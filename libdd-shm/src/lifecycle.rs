// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::backend::{Attachment, BackendKind, SegmentBackend};
use crate::config::ShmConfig;
use crate::error::ShmError;
use crate::key::SegmentKey;
use crate::segment::SegmentHandle;
use crate::sizing;
use nix::errno::Errno;
use std::ptr::NonNull;
use std::sync::Arc;

/// Creates, attaches and tears down shared segments through one backend,
/// chosen when the `Shm` is built and fixed afterwards.
#[derive(Clone, Debug)]
pub struct Shm {
    backend: Arc<dyn SegmentBackend>,
    page_size: usize,
}

impl Default for Shm {
    fn default() -> Self {
        Self::new(BackendKind::default())
    }
}

impl Shm {
    pub fn new(kind: BackendKind) -> Self {
        Self::with_backend(kind.into_backend())
    }

    pub fn from_config(config: &ShmConfig) -> Self {
        Self::new(config.backend)
    }

    pub fn with_backend(backend: Arc<dyn SegmentBackend>) -> Self {
        Self {
            backend,
            page_size: sizing::page_size(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes reserved for `nbytes` logical bytes, guard page included.
    pub fn allocation_size(&self, nbytes: usize) -> Option<usize> {
        sizing::allocation_size(nbytes, self.page_size)
    }

    /// Generates a key for the active backend: a random name fitting
    /// `max_length` bytes, or a token derived from the working directory and
    /// `project_id`.
    pub fn generate_key(&self, max_length: usize, project_id: i32) -> Result<SegmentKey, ShmError> {
        self.backend.generate_key(max_length, project_id)
    }

    /// Creates a segment of `nbytes` accessible bytes under `key` and maps it.
    ///
    /// The mapping is page aligned and followed by an inaccessible guard
    /// page. With `zero`, exactly the `nbytes` accessible bytes are cleared.
    /// `hint` is passed to the OS as the preferred address.
    ///
    /// Fails with [`ShmError::AlreadyExists`] if `key` is taken, even when
    /// another process wins a creation race, and never leaves a half-built
    /// object behind.
    pub fn init(
        &self,
        key: &SegmentKey,
        nbytes: usize,
        zero: bool,
        hint: Option<NonNull<u8>>,
    ) -> Result<SegmentHandle, ShmError> {
        if nbytes == 0 {
            return Err(ShmError::bad_alloc(
                "nbytes cannot be zero when allocating memory",
                Errno::EINVAL,
            ));
        }

        if self.backend.exists(key)? {
            return Err(ShmError::AlreadyExists {
                key: key.to_string(),
            });
        }

        let total = sizing::total_physical_memory().map_err(|errno| {
            ShmError::bad_alloc("failed to read the amount of physical memory", errno)
        })?;
        if nbytes > total {
            return Err(ShmError::SizeExceedsTotalMemory {
                requested: nbytes,
                total,
            });
        }

        let page_size = self.page_size;
        let alloc_bytes = self.allocation_size(nbytes).ok_or_else(|| {
            ShmError::bad_alloc(
                format!("{nbytes} bytes plus a guard page overflow the address space"),
                Errno::ENOMEM,
            )
        })?;

        let descriptor = self.backend.create_exclusive(key, alloc_bytes)?;
        let base = match self.backend.map(&descriptor, alloc_bytes, hint) {
            Ok(base) => base,
            Err(errno) => {
                if let Err(err) = self.backend.unlink(key) {
                    tracing::warn!(%key, "failed to remove segment after a failed mmap: {err}");
                }
                return Err(ShmError::bad_alloc(
                    format!("failed to mmap shm region \"{key}\" of {alloc_bytes} bytes, unlinking"),
                    errno,
                ));
            }
        };

        if zero {
            // SAFETY: the first nbytes of the fresh mapping are read-write.
            unsafe { base.as_ptr().write_bytes(0, nbytes) };
        }

        // SAFETY: the last page lies inside the mapping we just made.
        let guard = unsafe { base.as_ptr().add(alloc_bytes - page_size) };
        // SAFETY: guard is page aligned and covers exactly one mapped page.
        if unsafe { libc::mprotect(guard.cast(), page_size, libc::PROT_NONE) } != 0 {
            tracing::warn!(
                %key,
                "failed to set guard page protection, not fatal just dangerous: {}",
                Errno::last()
            );
        }

        tracing::debug!(%key, nbytes, alloc_bytes, zero, "initialized shared memory segment");
        Ok(SegmentHandle::new(
            base,
            nbytes,
            alloc_bytes,
            descriptor,
            self.backend.clone(),
        ))
    }

    /// [`init`](Self::init) sized for `count` values of `T`, mapped wherever
    /// the OS likes. View the result with [`SegmentHandle::cast`].
    pub fn init_for<T>(
        &self,
        key: &SegmentKey,
        count: usize,
        zero: bool,
    ) -> Result<SegmentHandle, ShmError> {
        let nbytes = count.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            ShmError::bad_alloc(
                format!(
                    "{count} values of {} bytes overflow the address space",
                    std::mem::size_of::<T>()
                ),
                Errno::ENOMEM,
            )
        })?;
        self.init(key, nbytes, zero, None)
    }

    /// Maps an existing segment in full. The guard page is not re-applied in
    /// this mapping.
    pub fn open(&self, key: &SegmentKey) -> Result<SegmentHandle, ShmError> {
        let Attachment {
            base,
            len,
            descriptor,
        } = self.backend.attach(key)?;
        Ok(SegmentHandle::new(
            base,
            len,
            len,
            descriptor,
            self.backend.clone(),
        ))
    }

    /// Unmaps `handle` (leaving it `None`) and, with `unlink`, removes the
    /// segment from the OS namespace.
    ///
    /// `nbytes` must be the size passed to [`init`](Self::init): it is run
    /// through the same allocation arithmetic to size the unmap. With `zero`,
    /// the first `nbytes` bytes are cleared before unmapping.
    ///
    /// Unmap failures are logged and otherwise ignored. Unlinking a key that
    /// names no segment fails with [`ShmError::InvalidKey`].
    pub fn close(
        &self,
        key: &SegmentKey,
        handle: &mut Option<SegmentHandle>,
        nbytes: usize,
        zero: bool,
        unlink: bool,
    ) -> Result<(), ShmError> {
        if let Some(mut segment) = handle.take() {
            if zero {
                segment.zero(nbytes);
            }
            let mapped_len = segment.mapped_len();
            let unmap_len = match self.allocation_size(nbytes) {
                Some(alloc_bytes) if alloc_bytes == mapped_len => alloc_bytes,
                alloc_bytes => {
                    tracing::warn!(
                        %key,
                        nbytes,
                        ?alloc_bytes,
                        mapped_len,
                        "close size does not match the mapping, pass the size given to init; \
                         unmapping the mapped length instead"
                    );
                    mapped_len
                }
            };
            if let Err(errno) = segment.unmap(unmap_len) {
                tracing::warn!(%key, "failed to unmap shared memory: {errno}");
            }
        }

        if unlink {
            self.backend.unlink(key)?;
        }
        Ok(())
    }
}
