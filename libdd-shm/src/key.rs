// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment keys.
//!
//! The name-based backend uses short random decimal names, unique with high
//! probability. The token-based backend derives an integer from a path and a
//! project id, so the same inputs always give the same key. Nothing here
//! guarantees uniqueness: callers pick their key and live with collisions.

use crate::error::ShmError;
use nix::errno::Errno;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Identifier under which a segment is created and later attached.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum SegmentKey {
    /// Entry in the POSIX shared memory namespace, without the leading `/`.
    Name(String),
    /// System V IPC key.
    Token(libc::key_t),
}

impl SegmentKey {
    pub fn name(name: impl Into<String>) -> Self {
        SegmentKey::Name(name.into())
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            SegmentKey::Name(name) => Some(name),
            SegmentKey::Token(_) => None,
        }
    }

    pub fn as_token(&self) -> Option<libc::key_t> {
        match self {
            SegmentKey::Name(_) => None,
            SegmentKey::Token(token) => Some(*token),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKey::Name(name) => f.write_str(name),
            SegmentKey::Token(token) => write!(f, "{token:#010x}"),
        }
    }
}

impl From<&str> for SegmentKey {
    fn from(name: &str) -> Self {
        SegmentKey::Name(name.to_owned())
    }
}

impl From<String> for SegmentKey {
    fn from(name: String) -> Self {
        SegmentKey::Name(name)
    }
}

static TOKEN_SOURCE: OnceLock<Mutex<StdRng>> = OnceLock::new();

/// Next value from the process-wide token source, uniform over
/// `0..=i32::MAX`. The generator is seeded from OS entropy on first use and
/// lives for the rest of the process. Safe to call from any thread.
pub fn next_token() -> u32 {
    let source = TOKEN_SOURCE.get_or_init(|| Mutex::new(StdRng::from_entropy()));
    // The generator holds no invariant a panicking holder could break.
    let mut rng = source.lock().unwrap_or_else(PoisonError::into_inner);
    rng.gen_range(0..=i32::MAX as u32)
}

/// Generates a random name key fitting a key buffer of `max_length` bytes,
/// terminator included.
pub fn random_name(max_length: usize) -> Result<SegmentKey, ShmError> {
    let name = truncate_name(&next_token().to_string(), max_length)?;
    Ok(SegmentKey::Name(name))
}

/// Copies `src` into `dst`. Name keys are cut to fit a buffer of
/// `max_length` bytes, terminator included; tokens are plain values and
/// always copy.
pub fn copy_key(
    dst: &mut SegmentKey,
    src: &SegmentKey,
    max_length: usize,
) -> Result<(), ShmError> {
    *dst = match src {
        SegmentKey::Name(name) => SegmentKey::Name(truncate_name(name, max_length)?),
        SegmentKey::Token(token) => SegmentKey::Token(*token),
    };
    Ok(())
}

fn truncate_name(name: &str, max_length: usize) -> Result<String, ShmError> {
    if max_length == 0 {
        return Err(ShmError::invalid_key(
            "key buffer length must be greater than zero",
            Errno::EINVAL,
        ));
    }
    // Keys are built from ASCII, but never split a code point.
    let mut end = name.len().min(max_length - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    if end == 0 {
        return Err(ShmError::invalid_key(
            format!("key buffer of {max_length} bytes cannot hold a key"),
            Errno::EINVAL,
        ));
    }
    Ok(name[..end].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShmErrorKind;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_in_range() {
        for _ in 0..1000 {
            assert!(next_token() <= i32::MAX as u32);
        }
    }

    #[test]
    fn tokens_from_many_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..64).map(|_| next_token()).collect::<Vec<_>>()))
            .collect();
        let all: HashSet<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        // 512 draws out of 2^31 values; a handful of collisions would be a bug.
        assert!(all.len() > 500);
    }

    #[test]
    fn names_are_decimal_and_bounded() {
        for max_length in [2, 5, 11, 32, 256] {
            let key = random_name(max_length).unwrap();
            let name = key.as_name().unwrap();
            assert!(!name.is_empty());
            assert!(name.len() < max_length);
            assert!(name.bytes().all(|b| b.is_ascii_digit()), "{name}");
        }
    }

    #[test]
    fn zero_length_buffer_is_invalid() {
        let err = random_name(0).unwrap_err();
        assert_eq!(ShmErrorKind::InvalidKey, err.kind());
        let err = random_name(1).unwrap_err();
        assert_eq!(ShmErrorKind::InvalidKey, err.kind());
    }

    #[test]
    fn copy_truncates_names() {
        let mut dst = SegmentKey::name("old");
        copy_key(&mut dst, &SegmentKey::name("123456789"), 5).unwrap();
        assert_eq!(SegmentKey::name("1234"), dst);

        copy_key(&mut dst, &SegmentKey::name("42"), 64).unwrap();
        assert_eq!(SegmentKey::name("42"), dst);

        let err = copy_key(&mut dst, &SegmentKey::name("42"), 0).unwrap_err();
        assert_eq!(ShmErrorKind::InvalidKey, err.kind());
        // A failed copy leaves the destination alone.
        assert_eq!(SegmentKey::name("42"), dst);
    }

    #[test]
    fn copy_assigns_tokens() {
        let mut dst = SegmentKey::name("old");
        copy_key(&mut dst, &SegmentKey::Token(0x2a01_0203), 0).unwrap();
        assert_eq!(SegmentKey::Token(0x2a01_0203), dst);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut dst = SegmentKey::name("");
        copy_key(&mut dst, &SegmentKey::name("aé"), 3).unwrap();
        assert_eq!(SegmentKey::name("a"), dst);
    }

    #[test]
    fn display() {
        assert_eq!("demo", SegmentKey::from("demo").to_string());
        assert_eq!("0x0000002a", SegmentKey::Token(42).to_string());
    }
}
