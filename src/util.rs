//! Small transport and queue helpers.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read exactly `buf.len()` bytes from `reader`, distinguishing a clean
/// end-of-stream (zero bytes read on the very first read) from a truncated
/// one (any bytes read before the stream closes).
///
/// Returns `Ok(false)` on clean end-of-stream, `Ok(true)` on a full read.
pub(crate) async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<bool> {
    if buf.is_empty() {
        return Ok(true);
    }
    let mut filled = 0;
    loop {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "transport closed mid-frame",
            ));
        }
        filled += n;
        if filled == buf.len() {
            return Ok(true);
        }
    }
}

/// Remove the first element of `queue` that is pointer-identical to `target`,
/// not merely equal by value. Used to cancel a specific pending accepter or
/// unmatched offer out of a FIFO queue (spec.md §9: "Removing a specific
/// accepter or offer on cancellation must be by identity").
pub(crate) fn remove_by_ptr<T>(queue: &mut VecDeque<Arc<T>>, target: &Arc<T>) -> Option<Arc<T>> {
    let pos = queue.iter().position(|item| Arc::ptr_eq(item, target))?;
    queue.remove(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_full_buffer() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"hello!!!").await.unwrap();
        drop(a);
        let mut buf = [0u8; 8];
        assert!(read_exact_or_eof(&mut b, &mut buf).await.unwrap());
        assert_eq!(&buf, b"hello!!!");
    }

    #[tokio::test]
    async fn clean_eof_on_empty_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let mut buf = [0u8; 9];
        assert!(!read_exact_or_eof(&mut b, &mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"ab").await.unwrap();
        drop(a);
        let mut buf = [0u8; 9];
        assert!(read_exact_or_eof(&mut b, &mut buf).await.is_err());
    }

    #[test]
    fn remove_by_ptr_is_identity_based() {
        let a = Arc::new(1_u32);
        let b = Arc::new(1_u32);
        let mut queue = VecDeque::new();
        queue.push_back(Arc::clone(&a));
        queue.push_back(Arc::clone(&b));
        let removed = remove_by_ptr(&mut queue, &b);
        assert!(removed.is_some());
        assert_eq!(queue.len(), 1);
        assert!(Arc::ptr_eq(&queue[0], &a));
    }
}
