//! WebSocket transport adapter.
//!
//! [`WsStream`] turns a WebSocket connection into the plain byte stream the
//! codecs expect: each write becomes one binary frame, and incoming binary
//! frames (or text frames, for the JSON codec) are surfaced as a contiguous
//! byte stream. Ping/pong frames are handled below this layer; a Close
//! frame reads as a clean end of stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// A WebSocket connection adapted to `AsyncRead + AsyncWrite`.
///
/// Usable on both ends: servers wrap accepted connections (done internally
/// by [`Server::serve_ws`](crate::Server::serve_ws)), clients wrap the
/// result of [`connect`] and hand it to [`Client::new`](crate::Client::new).
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    rbuf: Vec<u8>,
    rpos: usize,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            rbuf: Vec::new(),
            rpos: 0,
        }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.inner
    }
}

/// Connect to a WebSocket server and adapt the connection to a byte
/// stream.
pub async fn connect(url: &str) -> Result<WsStream<MaybeTlsStream<TcpStream>>, WsError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(WsStream::new(ws))
}

fn io_err(e: WsError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Drain leftover bytes from the last frame first.
            if this.rpos < this.rbuf.len() {
                let n = buf.remaining().min(this.rbuf.len() - this.rpos);
                buf.put_slice(&this.rbuf[this.rpos..this.rpos + n]);
                this.rpos += n;
                if this.rpos == this.rbuf.len() {
                    this.rbuf.clear();
                    this.rpos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(WsError::ConnectionClosed))) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io_err(e))),
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => {
                        this.rbuf = data;
                        this.rpos = 0;
                    }
                    Message::Text(text) => {
                        this.rbuf = text.into_bytes();
                        this.rpos = 0;
                    }
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                },
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io_err(e))),
            Poll::Ready(Ok(())) => {}
        }
        if let Err(e) = Pin::new(&mut this.inner).start_send(Message::Binary(buf.to_vec())) {
            return Poll::Ready(Err(io_err(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map(|r| r.map_err(io_err))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map(|r| match r {
                Ok(()) | Err(WsError::ConnectionClosed) => Ok(()),
                Err(e) => Err(io_err(e)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn bytes_survive_the_frame_boundary() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut stream = WsStream::new(ws);

            let mut got = [0u8; 10];
            stream.read_exact(&mut got).await.unwrap();
            stream.write_all(&got).await.unwrap();
            stream.flush().await.unwrap();
            got
        });

        let mut client = connect(&format!("ws://{addr}")).await.unwrap();
        // Two writes: the reader must reassemble across frames.
        client.write_all(b"hello").await.unwrap();
        client.write_all(b"world").await.unwrap();
        client.flush().await.unwrap();

        let mut echoed = [0u8; 10];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"helloworld");
        assert_eq!(&server.await.unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn close_frame_reads_as_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut stream = WsStream::new(ws);
            stream.shutdown().await.unwrap();
        });

        let mut client = connect(&format!("ws://{addr}")).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        server.await.unwrap();
    }
}
