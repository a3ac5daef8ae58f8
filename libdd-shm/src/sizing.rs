// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Page arithmetic shared by segment creation and teardown.
//!
//! A segment of `nbytes` logical bytes occupies `ceil(nbytes / page) + 1`
//! pages: the trailing page is the guard page. Creation and teardown must
//! both go through [`allocation_size`] so the two never drift apart.

use nix::errno::Errno;

/// The system page size.
#[inline]
pub fn page_size() -> usize {
    page_size::get()
}

/// Bytes reserved for a segment of `nbytes` logical bytes, including the
/// trailing guard page. Returns `None` if the result does not fit a `usize`.
#[inline]
pub fn allocation_size(nbytes: usize, page_size: usize) -> Option<usize> {
    debug_assert!(page_size.is_power_of_two());
    nbytes
        .div_ceil(page_size)
        .checked_add(1)?
        .checked_mul(page_size)
}

/// Number of pages covering `nbytes` bytes, without a guard page.
#[inline]
pub fn page_count(nbytes: usize, page_size: usize) -> usize {
    nbytes.div_ceil(page_size)
}

/// Distance of `addr` past the previous page boundary; zero when aligned.
#[inline]
pub fn page_offset(addr: usize, page_size: usize) -> usize {
    addr & (page_size - 1)
}

/// Total bytes of physical memory on the host.
pub fn total_physical_memory() -> Result<usize, Errno> {
    Errno::clear();
    // SAFETY: sysconf has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages <= 0 {
        return Err(match Errno::last() {
            Errno::UnknownErrno => Errno::ENOSYS,
            errno => errno,
        });
    }
    (pages as usize)
        .checked_mul(page_size())
        .ok_or(Errno::EOVERFLOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::TypeGenerator;

    #[test]
    fn guard_page_is_always_added() {
        let page = 4096;
        assert_eq!(Some(2 * page), allocation_size(1, page));
        assert_eq!(Some(2 * page), allocation_size(page, page));
        assert_eq!(Some(3 * page), allocation_size(page + 1, page));
        // Zero bytes still reserve the guard page.
        assert_eq!(Some(page), allocation_size(0, page));
    }

    #[test]
    fn overflow_is_reported() {
        assert_eq!(None, allocation_size(usize::MAX, 4096));
        assert_eq!(None, allocation_size(usize::MAX - 4096, 4096));
    }

    #[test]
    fn fuzz_allocation_size() {
        let sizes = usize::produce();
        let shifts = 12u32..=21;
        bolero::check!()
            .with_generator((sizes, shifts))
            .for_each(|(nbytes, shift)| {
                let page = 1usize << *shift;
                if let Some(alloc) = allocation_size(*nbytes, page) {
                    assert_eq!(0, alloc % page);
                    assert!(alloc - page >= *nbytes);
                    assert!(alloc - page < *nbytes + page);
                    assert_eq!(page_count(*nbytes, page) + 1, alloc / page);
                }
            });
    }

    #[test]
    fn offsets() {
        let page = page_size();
        assert_eq!(0, page_offset(0, page));
        assert_eq!(0, page_offset(page * 3, page));
        assert_eq!(1, page_offset(page + 1, page));
        assert_eq!(page - 1, page_offset(2 * page - 1, page));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn host_reports_memory() {
        let total = total_physical_memory().unwrap();
        assert!(total >= page_size());
        assert_eq!(0, total % page_size());
    }
}
