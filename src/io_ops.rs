// src/io_ops.rs
//
// Full-transfer I/O helpers. These are used directly by the
// blocking, process-per-connection and thread-per-connection transports,
// which loop to completion on an OS thread; the readiness and completion
// transports instead drive the single-attempt primitives in `syscalls`
// from their own state machines and never block.

use crate::config::BLOCK_SIZE;
use crate::error::FtResult;
use crate::syscalls::{pread_at, pwrite_at, send_nonblocking};
use std::os::unix::io::RawFd;

/// Send `buf` in full, retrying on short writes. The fd may be blocking or
/// non-blocking; `Ok(None)` from `send_nonblocking` (EAGAIN on a
/// non-blocking fd) just spins back around, since this helper is only
/// ever used by the blocking-style transports.
pub fn send_fully(fd: RawFd, buf: &[u8]) -> FtResult<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match send_nonblocking(fd, &buf[sent..])? {
            Some(0) => break,
            Some(n) => sent += n,
            None => continue,
        }
    }
    Ok(())
}

/// Round `len` up to the next multiple of `BLOCK_SIZE`. The O_DIRECT write
/// path must submit a block-aligned length; a body that ends mid-block is
/// padded with the zeros the caller already wrote into the buffer tail
/// (`AlignedBuffer::zero_tail`), so the file on disk ends up rounded up to
/// the next block boundary. This is the PUT pipeline's documented quirk,
/// not something this helper hides.
pub fn round_up_to_block(len: usize) -> usize {
    (len + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

/// Write `buf[..round_up_to_block(len)]` at `offset` in full, retrying on
/// short writes. `offset` must already be block-aligned; the caller is
/// responsible for zero-padding `buf` beyond `len` up to the rounded length.
pub fn write_fully(fd: RawFd, buf: &[u8], len: usize, offset: u64) -> FtResult<()> {
    debug_assert_eq!(offset % BLOCK_SIZE as u64, 0);
    let rounded = round_up_to_block(len);
    let mut written = 0;
    while written < rounded {
        let n = pwrite_at(fd, &buf[written..rounded], offset + written as u64)?;
        if n == 0 {
            break;
        }
        written += n;
    }
    Ok(())
}

/// Read up to `buf.len()` bytes at `offset` in full (short of EOF),
/// retrying on short reads. Used by the GET pipeline's blocking-style
/// transports; readiness/completion transports issue one `pread_at` per
/// wakeup instead.
pub fn read_fully_at(fd: RawFd, buf: &mut [u8], offset: u64) -> FtResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = pread_at(fd, &mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_block_is_identity_on_block_multiples() {
        assert_eq!(round_up_to_block(0), 0);
        assert_eq!(round_up_to_block(BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(round_up_to_block(BLOCK_SIZE * 3), BLOCK_SIZE * 3);
    }

    #[test]
    fn round_up_to_block_rounds_partial_blocks_up() {
        assert_eq!(round_up_to_block(1), BLOCK_SIZE);
        assert_eq!(round_up_to_block(BLOCK_SIZE + 1), BLOCK_SIZE * 2);
        assert_eq!(round_up_to_block(100), BLOCK_SIZE);
    }
}
