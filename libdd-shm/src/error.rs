// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use thiserror::Error;

/// Discriminant of a [`ShmError`], for callers that only branch on the class
/// of failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ShmErrorKind {
    AlreadyExists,
    NotFound,
    BadAlloc,
    SizeExceedsTotalMemory,
    AlignmentError,
    InvalidKey,
}

/// Every failure surfaced by the segment lifecycle. Each variant carries the
/// OS error code observed right after the failing call, plus enough context
/// (key, byte counts) to make the message useful on its own.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory segment \"{key}\" already exists, please use open")]
    AlreadyExists { key: String },

    #[error("shared memory segment \"{key}\" does not exist: {errno}")]
    NotFound { key: String, errno: Errno },

    #[error("{context}: {errno}")]
    BadAlloc { context: String, errno: Errno },

    #[error("tried to allocate {requested} bytes, the total possible is {total} bytes")]
    SizeExceedsTotalMemory { requested: usize, total: usize },

    #[error("pointer {addr:#x} must be page aligned, it is {offset} bytes off a {page_size} byte page")]
    Alignment {
        addr: usize,
        offset: usize,
        page_size: usize,
    },

    #[error("{context}: {errno}")]
    InvalidKey { context: String, errno: Errno },
}

impl ShmError {
    pub fn kind(&self) -> ShmErrorKind {
        match self {
            ShmError::AlreadyExists { .. } => ShmErrorKind::AlreadyExists,
            ShmError::NotFound { .. } => ShmErrorKind::NotFound,
            ShmError::BadAlloc { .. } => ShmErrorKind::BadAlloc,
            ShmError::SizeExceedsTotalMemory { .. } => ShmErrorKind::SizeExceedsTotalMemory,
            ShmError::Alignment { .. } => ShmErrorKind::AlignmentError,
            ShmError::InvalidKey { .. } => ShmErrorKind::InvalidKey,
        }
    }

    /// The raw OS error code associated with this failure. Library-detected
    /// conditions report the code the equivalent syscall would have set.
    pub fn os_code(&self) -> i32 {
        self.errno() as i32
    }

    pub fn errno(&self) -> Errno {
        match self {
            ShmError::AlreadyExists { .. } => Errno::EEXIST,
            ShmError::NotFound { errno, .. }
            | ShmError::BadAlloc { errno, .. }
            | ShmError::InvalidKey { errno, .. } => *errno,
            ShmError::SizeExceedsTotalMemory { .. } => Errno::ENOMEM,
            ShmError::Alignment { .. } => Errno::EINVAL,
        }
    }

    pub(crate) fn bad_alloc(context: impl Into<String>, errno: Errno) -> Self {
        ShmError::BadAlloc {
            context: context.into(),
            errno,
        }
    }

    pub(crate) fn invalid_key(context: impl Into<String>, errno: Errno) -> Self {
        ShmError::InvalidKey {
            context: context.into(),
            errno,
        }
    }
}
