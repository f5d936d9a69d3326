//! Sequential probing of a bounded range of candidate ports or slots.

use std::{error::Error as StdError, future::Future, ops::RangeInclusive};
use tracing::{debug, trace};

pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no candidates to try in range {start}..={end}")]
    EmptyRange { start: u16, end: u16 },
    #[error("all {attempts} candidates in range {start}..={end} failed, last error: {source}")]
    Exhausted {
        start: u16,
        end: u16,
        attempts: usize,
        #[source]
        source: BoxError,
    },
}

/// Awaits `attempt(i)` for each `i` in `range`, in increasing order, and
/// returns the first success without making further attempts.
///
/// When every candidate fails the last failure is reported, boxed regardless
/// of whether it was a message, an I/O error or anything else convertible.
pub async fn discover<T, E, F, Fut>(
    range: RangeInclusive<u16>,
    mut attempt: F,
) -> Result<T, DiscoveryError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let (start, end) = (*range.start(), *range.end());
    let mut last_error = None;
    let mut attempts = 0;

    for candidate in range {
        attempts += 1;
        match attempt(candidate).await {
            Ok(value) => {
                debug!(candidate, attempts, "Candidate accepted");
                return Ok(value);
            }
            Err(e) => {
                let e = e.into();
                trace!(candidate, error = %e, "Candidate rejected");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(source) => Err(DiscoveryError::Exhausted {
            start,
            end,
            attempts,
            source,
        }),
        None => Err(DiscoveryError::EmptyRange { start, end }),
    }
}

/// Candidates strictly after `claimed`, up to `end`.
///
/// The real endpoint takes the first free slot of the same range, so once the
/// proxy holds `claimed` it sits right behind it.
#[must_use]
pub fn after(claimed: u16, end: u16) -> RangeInclusive<u16> {
    claimed.saturating_add(1)..=end
}
