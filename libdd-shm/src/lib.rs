// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![cfg(unix)]

//! Shared memory segments that unrelated processes create and attach to by
//! key.
//!
//! A segment lives in one of two OS namespaces, picked through
//! [`BackendKind`]: POSIX objects addressed by name, or System V segments
//! addressed by an integer token (Linux only). [`Shm`] runs the lifecycle on
//! top of either:
//!
//! ```no_run
//! use libdd_shm::{BackendKind, Shm};
//!
//! # fn main() -> Result<(), libdd_shm::ShmError> {
//! let shm = Shm::new(BackendKind::Posix);
//! let key = shm.generate_key(32, 42)?;
//! let mut segment = Some(shm.init(&key, 4096, true, None)?);
//! // ... hand `key` to another process, which calls `shm.open(&key)` ...
//! shm.close(&key, &mut segment, 4096, true, true)?;
//! # Ok(())
//! # }
//! ```
//!
//! Every creator mapping ends with an inaccessible guard page, so running off
//! the end of a segment faults instead of reading a neighbour.
//! [`move_to_tid_numa`] optionally migrates a segment's pages toward the NUMA
//! node a thread runs on.

mod backend;
pub mod config;
mod error;
mod key;
mod lifecycle;
pub mod numa;
mod segment;
pub mod sizing;

#[cfg(target_os = "linux")]
pub use backend::{path_token, SysvBackend};
pub use backend::{
    Attachment, BackendKind, PosixBackend, SegmentBackend, SegmentDescriptor, UnknownBackend,
};
pub use config::ShmConfig;
pub use error::{ShmError, ShmErrorKind};
pub use key::{copy_key, next_token, random_name, SegmentKey};
pub use lifecycle::Shm;
pub use numa::{move_to_tid_numa, NumaPlacer, PlacementOutcome};
pub use segment::SegmentHandle;
