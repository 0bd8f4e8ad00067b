//! The client-facing side of a virtual tunnel connection.
//!
//! A [`VirtualStream`] is one half of a pair of bounded byte channels; the
//! other half is serviced by the device pump, which shuttles the bytes in
//! and out of a smoltcp socket inside the tunnel.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::PollSender;

pub struct VirtualStream {
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    tx: PollSender<Bytes>,
    wake: Arc<Notify>,
}

impl VirtualStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Bytes>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            rx,
            leftover: Bytes::new(),
            tx: PollSender::new(tx),
            wake,
        }
    }

    fn serve_leftover(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover[..n]);
        self.leftover = self.leftover.slice(n..);
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.leftover.is_empty() {
            this.serve_leftover(buf);
            return Poll::Ready(Ok(()));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                this.leftover = chunk;
                this.serve_leftover(buf);
                Poll::Ready(Ok(()))
            }
            // Channel closed: the tunnel side reached EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                if this.tx.send_item(Bytes::copy_from_slice(buf)).is_err() {
                    return Poll::Ready(Err(broken_pipe()));
                }

                this.wake.notify_one();
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Write-close: the pump drains what is already queued, then sends a
    /// FIN on the tunnel socket.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.tx.close();
        this.wake.notify_one();
        Poll::Ready(Ok(()))
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel connection closed")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::{Notify, mpsc};

    use super::*;

    #[tokio::test]
    async fn reads_chunks_across_buffer_boundaries() {
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let mut stream = VirtualStream::new(rx, out_tx, Arc::new(Notify::new()));

        tx.send(Bytes::from_static(b"hello world")).await.unwrap();
        drop(tx);

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b" world");
    }

    #[tokio::test]
    async fn eof_on_closed_channel() {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let mut stream = VirtualStream::new(rx, out_tx, Arc::new(Notify::new()));

        drop(tx);

        let mut buf = Vec::new();
        let n = stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn writes_reach_the_pump_side() {
        let (_in_tx, rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let wake = Arc::new(Notify::new());
        let mut stream = VirtualStream::new(rx, out_tx, wake);

        stream.write_all(b"through the tunnel").await.unwrap();
        assert_eq!(&out_rx.recv().await.unwrap()[..], b"through the tunnel");

        stream.shutdown().await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_after_pump_exit_is_broken_pipe() {
        let (_in_tx, rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(1);
        let mut stream = VirtualStream::new(rx, out_tx, Arc::new(Notify::new()));

        drop(out_rx);

        let err = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
