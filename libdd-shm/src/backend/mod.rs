// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OS object backends.
//!
//! Both backends expose the same capability set (probe, exclusive creation,
//! mapping, attach, detach, unlink) so the lifecycle code in
//! [`crate::lifecycle`] never branches on which one is active.

mod posix;
#[cfg(target_os = "linux")]
mod sysv;

pub use posix::PosixBackend;
#[cfg(target_os = "linux")]
pub use sysv::{path_token, SysvBackend};

use crate::error::ShmError;
use crate::key::SegmentKey;
use nix::errno::Errno;
use std::fmt;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::Arc;

/// Which OS facility backs the segments.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BackendKind {
    /// `shm_open` names, keyed by short strings.
    #[default]
    Posix,
    /// System V `shmget` segments, keyed by `ftok` tokens.
    SystemV,
}

impl BackendKind {
    /// Instantiates the backend. System V is only wired up on Linux; other
    /// targets get the POSIX backend.
    pub fn into_backend(self) -> Arc<dyn SegmentBackend> {
        match self {
            BackendKind::Posix => Arc::new(PosixBackend),
            #[cfg(target_os = "linux")]
            BackendKind::SystemV => Arc::new(SysvBackend),
            #[cfg(not(target_os = "linux"))]
            BackendKind::SystemV => {
                tracing::warn!("System V shared memory is unsupported here, using POSIX");
                Arc::new(PosixBackend)
            }
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Posix => "posix",
            BackendKind::SystemV => "sysv",
        })
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct UnknownBackend(pub String);

impl fmt::Display for UnknownBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown shared memory backend \"{}\"", self.0)
    }
}

impl std::error::Error for UnknownBackend {}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posix" | "name" => Ok(BackendKind::Posix),
            "sysv" | "systemv" | "system-v" | "token" => Ok(BackendKind::SystemV),
            _ => Err(UnknownBackend(s.to_owned())),
        }
    }
}

/// The OS-side object a mapping came from.
#[derive(Debug)]
pub enum SegmentDescriptor {
    /// Descriptor returned by `shm_open`, closed with the handle.
    Fd(OwnedFd),
    /// System V segment identifier.
    ShmId(libc::c_int),
}

/// A fresh mapping of an existing segment.
#[derive(Debug)]
pub struct Attachment {
    pub base: NonNull<u8>,
    /// Size of the backing object, which is also the mapped length.
    pub len: usize,
    pub descriptor: SegmentDescriptor,
}

pub trait SegmentBackend: fmt::Debug + Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Produces a key of the form this backend understands.
    fn generate_key(&self, max_length: usize, project_id: i32) -> Result<SegmentKey, ShmError>;

    /// Whether an object already exists under `key`. Issues no mutating call.
    fn exists(&self, key: &SegmentKey) -> Result<bool, ShmError>;

    /// Creates the object under `key` and sizes it to `alloc_bytes`, failing
    /// with [`ShmError::AlreadyExists`] if another creator got there first.
    /// On a sizing failure the object is removed before returning.
    fn create_exclusive(
        &self,
        key: &SegmentKey,
        alloc_bytes: usize,
    ) -> Result<SegmentDescriptor, ShmError>;

    /// Maps `alloc_bytes` of a freshly created object shared and read-write,
    /// at `hint` if given.
    fn map(
        &self,
        descriptor: &SegmentDescriptor,
        alloc_bytes: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, Errno>;

    /// Maps the whole of an existing object.
    fn attach(&self, key: &SegmentKey) -> Result<Attachment, ShmError>;

    /// Releases a mapping made by [`map`](Self::map) or
    /// [`attach`](Self::attach).
    ///
    /// # Safety
    /// `base` and `len` must describe a mapping made by this backend that
    /// nothing references anymore.
    unsafe fn detach(&self, base: NonNull<u8>, len: usize) -> Result<(), Errno>;

    /// Removes the object from the OS namespace. Mappings stay valid until
    /// detached.
    fn unlink(&self, key: &SegmentKey) -> Result<(), ShmError>;
}

pub(crate) fn mismatched_descriptor(kind: BackendKind) -> Errno {
    tracing::debug!("{kind} backend handed a descriptor it did not create");
    Errno::EBADF
}
