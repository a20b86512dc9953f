//! Page-range resolution and work partitioning.
//!
//! A single-document task splits its page range into `job` contiguous,
//! non-overlapping slices, computed once at construction. When the page count
//! does not divide evenly, the first `remainder` workers each take one extra
//! page (amortization), so slice lengths never differ by more than one.
//!
//! ```text
//! 241 pages, job = 3  →  min = 80, remainder = 1
//! worker 0: [  1,  81]   81 pages  (+1 amortized)
//! worker 1: [ 82, 161]   80 pages
//! worker 2: [162, 241]   80 pages
//! ```

use crate::error::Pdf2ImgError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default worker count for batch conversions.
pub const BATCH_DEFAULT_JOB: usize = 4;

/// An inclusive, 1-based, non-empty page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    /// Build a range, rejecting `first > last`.
    pub fn new(first: u32, last: u32) -> Result<Self, Pdf2ImgError> {
        if first == 0 || first > last {
            return Err(Pdf2ImgError::InvalidPageRange { first, last });
        }
        Ok(Self { first, last })
    }

    /// Number of pages in the range.
    pub fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    /// Always false: a `PageRange` holds at least one page.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, page: u32) -> bool {
        (self.first..=self.last).contains(&page)
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

/// Resolve the requested `first..=last` against the document's real page count.
///
/// A missing `last`, or one past the end of the document, means "up to the
/// last page".
pub fn resolve_range(
    first: u32,
    last: Option<u32>,
    total_pages: u32,
) -> Result<PageRange, Pdf2ImgError> {
    let last = match last {
        Some(last) if last <= total_pages => last,
        _ => total_pages,
    };
    PageRange::new(first, last)
}

/// Single-document worker count when none was configured.
pub fn infer_job(page_count: u32) -> usize {
    match page_count {
        n if n > 50 => 3,
        n if n > 20 => 2,
        _ => 1,
    }
}

/// Effective worker count for a single document: the configured (or inferred)
/// job, clamped so that no worker receives an empty range.
pub fn effective_job(range: PageRange, job: Option<usize>) -> usize {
    let wanted = job.unwrap_or_else(|| infer_job(range.len())).max(1);
    wanted.min(range.len() as usize)
}

/// Split `range` across `job` workers.
///
/// Slices are returned in ascending order of their start page and exactly
/// cover `range`.
///
/// # Panics
/// When `job` is zero or larger than the page count, or if the arithmetic ever
/// produces a slice ending past `range.last`. Callers go through
/// [`effective_job`] first, so either case is a bug.
pub fn split(range: PageRange, job: usize) -> Vec<PageRange> {
    let page_count = range.len();
    let job = u32::try_from(job).unwrap_or(u32::MAX);
    assert!(
        job >= 1 && job <= page_count,
        "job {job} out of bounds for {page_count} pages"
    );

    let min_per_worker = page_count / job;
    let remainder = page_count % job;

    (0..job)
        .map(|index| {
            let amortization = u32::from(index < remainder);
            let first = range.first + index * min_per_worker + index.min(remainder);
            let last = first + min_per_worker + amortization - 1;
            assert!(
                last <= range.last,
                "wrong calculation: worker {index} last page {last} exceeds task last page {}",
                range.last
            );
            PageRange { first, last }
        })
        .collect()
}
