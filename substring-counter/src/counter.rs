use crate::types::{CounterError, Result};
use num_bigint::BigUint;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Roughly the body size of an average web page, so most sources are
/// consumed in a single read.
pub const DEFAULT_BUFFER_SIZE: usize = 2_000_000;

/// Streaming matcher for a fixed byte sequence.
///
/// The match cursor survives between calls to [`SubstringCounter::scan`], so an
/// occurrence split across two reads is still counted. Matches never overlap:
/// a completed match resets the cursor to zero. On a mismatch only the current
/// byte is re-tested against the first target byte; longer partial matches are
/// not reconsidered, so targets whose prefix repeats inside them (e.g. `"aab"`
/// in `"aaab"`) can be missed.
#[derive(Debug, Clone)]
pub struct SubstringCounter<'a> {
    target: &'a [u8],
    cursor: usize,
}

impl<'a> SubstringCounter<'a> {
    /// # Panics
    ///
    /// Panics if `target` is empty.
    pub fn new(target: &'a [u8]) -> Self {
        assert!(!target.is_empty(), "length of substring must be bigger than zero");
        Self { target, cursor: 0 }
    }

    /// Feeds the next chunk of the stream and returns the occurrences completed in it.
    pub fn scan(&mut self, chunk: &[u8]) -> u64 {
        let mut found = 0;
        for &byte in chunk {
            if byte == self.target[self.cursor] {
                self.cursor += 1;
            } else {
                self.cursor = usize::from(byte == self.target[0]);
            }

            if self.cursor == self.target.len() {
                found += 1;
                self.cursor = 0;
            }
        }
        found
    }

    /// Length of the partial match carried into the next chunk.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

/// Counts occurrences of `target` in `reader`, reading `buf.len()` bytes at a time.
///
/// Cancellation is checked before every read. End of stream finishes the count,
/// the first read error is returned as is.
pub async fn count<R>(
    reader: &mut R,
    buf: &mut [u8],
    target: &[u8],
    cancel: &CancellationToken,
) -> Result<BigUint>
where
    R: AsyncRead + Unpin + ?Sized,
{
    assert!(!buf.is_empty(), "read buffer must not be empty");
    let mut counter = SubstringCounter::new(target);
    let mut total = BigUint::default();

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CounterError::Cancelled),
            read = reader.read(buf) => read?,
        };

        if n == 0 {
            return Ok(total);
        }

        total += counter.scan(&buf[..n]);
    }
}
