//! Bidirectional stream-copy engine
//!
//! Couples two byte endpoints (one tunnel stream, one real socket) with
//! two independent unidirectional copies. The first copy to terminate,
//! for any reason, cancels a scope shared by both directions so the
//! opposite copy unblocks immediately; the engine returns only after
//! both directions have observed termination.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Bytes moved in each direction: (a→b, b→a).
pub type Transferred = (u64, u64);

/// Copy bytes between `a` and `b` until either side terminates.
///
/// `buf_size` is the per-direction buffer size; each direction allocates
/// its own buffer. `parent` scopes the whole engine: cancelling it tears
/// both directions down. Returns the first I/O error observed, if any;
/// callers log it at debug severity since clean EOF is routine.
pub async fn couple<A, B>(
    a: A,
    b: B,
    buf_size: usize,
    parent: &CancellationToken,
) -> (Transferred, Option<std::io::Error>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let scope = parent.child_token();
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let forward = copy_direction(&mut ar, &mut bw, buf_size, &scope);
    let backward = copy_direction(&mut br, &mut aw, buf_size, &scope);

    let ((sent, err_f), (received, err_b)) = tokio::join!(forward, backward);

    ((sent, received), err_f.or(err_b))
}

/// One copy direction. Cancels `scope` on exit so the peer direction
/// unblocks; a cancelled scope aborts our own pending read/write.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf_size: usize,
    scope: &CancellationToken,
) -> (u64, Option<std::io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = BytesMut::with_capacity(buf_size);
    buf.resize(buf_size, 0);

    let err = loop {
        let n = tokio::select! {
            res = reader.read(&mut buf) => match res {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) => break Some(e),
            },
            _ = scope.cancelled() => break None,
        };

        let write = tokio::select! {
            res = writer.write_all(&buf[..n]) => res,
            _ = scope.cancelled() => break None,
        };
        if let Err(e) = write {
            break Some(e);
        }
        if let Err(e) = writer.flush().await {
            break Some(e);
        }

        total += n as u64;
    };

    scope.cancel();
    let _ = writer.shutdown().await;
    (total, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_couple_moves_bytes_both_ways() {
        let (a_near, mut a_far) = duplex(1024);
        let (b_near, mut b_far) = duplex(1024);
        let token = CancellationToken::new();

        let engine = tokio::spawn(async move { couple(a_near, b_near, 4096, &token).await });

        a_far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b_far.write_all(b"world").await.unwrap();
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // Closing one endpoint ends the engine even though the other
        // direction is still idle.
        drop(a_far);
        let ((sent, received), err) = engine.await.unwrap();
        assert_eq!(sent, 5);
        assert_eq!(received, 5);
        assert!(err.is_none());
        drop(b_far);
    }

    #[tokio::test]
    async fn test_couple_parent_cancellation_unblocks() {
        let (a_near, a_far) = duplex(64);
        let (b_near, b_far) = duplex(64);
        let token = CancellationToken::new();

        let child = token.clone();
        let engine = tokio::spawn(async move { couple(a_near, b_near, 1024, &child).await });

        // Neither side ever writes; only cancellation ends the engine.
        token.cancel();
        let ((sent, received), _) = engine.await.unwrap();
        assert_eq!(sent, 0);
        assert_eq!(received, 0);
        drop(a_far);
        drop(b_far);
    }

    #[tokio::test]
    async fn test_couple_returns_after_both_directions() {
        let (a_near, mut a_far) = duplex(1024);
        let (b_near, mut b_far) = duplex(1024);
        let token = CancellationToken::new();

        let engine = tokio::spawn(async move { couple(a_near, b_near, 1024, &token).await });

        a_far.write_all(b"x").await.unwrap();
        a_far.shutdown().await.unwrap();

        // The b side sees the byte, then EOF once the engine tears down.
        let mut buf = Vec::new();
        b_far.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"x");

        let ((sent, _), _) = engine.await.unwrap();
        assert_eq!(sent, 1);
    }
}
