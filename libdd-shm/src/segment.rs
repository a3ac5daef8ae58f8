// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::backend::{SegmentBackend, SegmentDescriptor};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// This process's mapping of a shared segment.
///
/// Every process gets its own handle from [`Shm::init`](crate::Shm::init) or
/// [`Shm::open`](crate::Shm::open); handles are never passed between
/// processes. Release it with [`Shm::close`](crate::Shm::close). A handle
/// dropped without `close` is detached, never unlinked.
///
/// The library does not synchronize access to the bytes: processes sharing a
/// segment coordinate through atomics or locks of their own.
pub struct SegmentHandle {
    base: NonNull<u8>,
    /// Bytes the caller may touch.
    len: usize,
    /// Bytes actually mapped, guard page included.
    mapped_len: usize,
    descriptor: SegmentDescriptor,
    backend: Arc<dyn SegmentBackend>,
    mapped: bool,
}

// SAFETY: the handle owns its mapping; the bytes are shared memory that the
// library never dereferences on its own except under &mut self.
unsafe impl Send for SegmentHandle {}
unsafe impl Sync for SegmentHandle {}

impl SegmentHandle {
    pub(crate) fn new(
        base: NonNull<u8>,
        len: usize,
        mapped_len: usize,
        descriptor: SegmentDescriptor,
        backend: Arc<dyn SegmentBackend>,
    ) -> Self {
        Self {
            base,
            len,
            mapped_len,
            descriptor,
            backend,
            mapped: true,
        }
    }

    /// Page-aligned start of the mapping.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Typed view of the start of the segment.
    pub fn cast<T>(&self) -> NonNull<T> {
        self.base.cast()
    }

    /// Accessible bytes: the requested size for a creator, the size of the
    /// backing object for an attacher.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes covered by the mapping, guard page included.
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    /// The accessible bytes. Other processes may write them concurrently:
    /// this is a snapshot view, not a synchronized one.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [base, base + len) stays mapped read-write while self lives.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self rules out aliasing in this process.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }

    pub(crate) fn zero(&mut self, nbytes: usize) {
        let nbytes = nbytes.min(self.len);
        // SAFETY: nbytes is within the accessible range.
        unsafe { self.base.as_ptr().write_bytes(0, nbytes) };
    }

    /// Releases `len` bytes of the mapping. The handle is inert afterwards
    /// whatever the outcome.
    pub(crate) fn unmap(&mut self, len: usize) -> Result<(), nix::errno::Errno> {
        self.mapped = false;
        // SAFETY: the mapping came from this backend and the handle is being
        // consumed, so nothing in this process references it anymore.
        unsafe { self.backend.detach(self.base, len) }
    }
}

impl fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("mapped_len", &self.mapped_len)
            .field("descriptor", &self.descriptor)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        if !self.mapped {
            return;
        }
        let len = self.mapped_len;
        match self.unmap(len) {
            Ok(()) => tracing::debug!(len, "detached shared memory segment on drop"),
            Err(errno) => {
                tracing::warn!(len, "failed to detach shared memory segment on drop: {errno}")
            }
        }
    }
}
