use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::message_socket::{
    AsyncMessageSocket, AsyncRecvMessages, AsyncSendMessages, AsyncShutdownMessages,
    OutboundMessage, SocketInfo,
};
use crate::util::allocate_vec;

const WRITE_BUFFER_LEN: usize = 65536;

/// Presents a connected TCP stream as a message socket.
///
/// Messages are written as raw bytes with no framing; message boundaries on
/// the receive side are whatever the stream's reads produce. Accepted
/// messages land in an internal write buffer and are flushed within the same
/// call when the stream is writable, or by a later send/shutdown call when it
/// is not. Destinations are ignored: the stream is already connected.
pub struct TcpMessageStream {
    stream: TcpStream,
    write_buf: Box<[u8]>,
    write_buf_pos: usize,
    write_buf_end: usize,
}

impl TcpMessageStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            write_buf: allocate_vec(WRITE_BUFFER_LEN).into_boxed_slice(),
            write_buf_pos: 0,
            write_buf_end: 0,
        }
    }

    fn poll_flush_write_buf(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.write_buf_pos < self.write_buf_end {
            let remaining = &self.write_buf[self.write_buf_pos..self.write_buf_end];
            match ready!(Pin::new(&mut self.stream).poll_write(cx, remaining)) {
                Ok(0) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "failed to write buffered message bytes",
                    )));
                }
                Ok(n) => {
                    self.write_buf_pos += n;
                }
                Err(e) => {
                    return Poll::Ready(Err(e));
                }
            }
        }
        self.write_buf_pos = 0;
        self.write_buf_end = 0;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRecvMessages for TcpMessageStream {
    fn poll_recv_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &mut [ReadBuf<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let buf = match bufs.first_mut() {
            Some(buf) => buf,
            None => return Poll::Ready(Ok(0)),
        };
        let filled_before = buf.filled().len();
        ready!(Pin::new(&mut this.stream).poll_read(cx, buf))?;
        if buf.filled().len() == filled_before {
            // EOF: nothing to deliver.
            return Poll::Ready(Ok(0));
        }
        Poll::Ready(Ok(1))
    }
}

impl AsyncSendMessages for TcpMessageStream {
    fn poll_send_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        messages: &[OutboundMessage<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let mut accepted = 0;
        for message in messages {
            if message.length > this.write_buf.len() {
                if accepted > 0 {
                    break;
                }
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "message too large for write buffer",
                )));
            }
            if this.write_buf.len() - this.write_buf_end < message.length {
                match this.poll_flush_write_buf(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Pending => {
                        if accepted > 0 {
                            break;
                        }
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(e)) => {
                        if accepted > 0 {
                            break;
                        }
                        return Poll::Ready(Err(e));
                    }
                }
            }
            // Compact the scattered buffers directly into the write buffer,
            // stopping once the declared length is reached.
            let start = this.write_buf_end;
            let mut offset = 0;
            for buffer in message.buffers {
                if offset == message.length {
                    break;
                }
                let len = std::cmp::min(message.length - offset, buffer.len());
                this.write_buf[start + offset..start + offset + len]
                    .copy_from_slice(&buffer[..len]);
                offset += len;
            }
            debug_assert_eq!(offset, message.length);
            this.write_buf_end = start + offset;
            accepted += 1;
        }
        // Bytes that do not go out now are flushed by a later call.
        if let Poll::Ready(Err(e)) = this.poll_flush_write_buf(cx) {
            if accepted == 0 {
                return Poll::Ready(Err(e));
            }
        }
        Poll::Ready(Ok(accepted))
    }
}

impl AsyncShutdownMessages for TcpMessageStream {
    fn poll_shutdown_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_write_buf(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

impl SocketInfo for TcpMessageStream {
    fn is_reliable(&self) -> bool {
        true
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

impl AsyncMessageSocket for TcpMessageStream {}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::IoSlice;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::message_socket::{recv_messages, send_messages, shutdown_messages};

    #[tokio::test]
    async fn test_scattered_write_and_read_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut data = [0u8; 9];
            stream.read_exact(&mut data).await.unwrap();
            assert_eq!(&data, b"scattered");
            stream.write_all(b"response").await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = TcpMessageStream::new(stream);
        assert!(stream.is_reliable());

        let buffers = [
            IoSlice::new(b"sca"),
            IoSlice::new(b"tte"),
            IoSlice::new(b"red"),
        ];
        let message = OutboundMessage::new(&buffers, None);
        assert_eq!(send_messages(&mut stream, &[message]).await.unwrap(), 1);

        let mut data = [0u8; 64];
        let mut bufs = [ReadBuf::new(&mut data)];
        assert_eq!(recv_messages(&mut stream, &mut bufs).await.unwrap(), 1);
        assert_eq!(bufs[0].filled(), b"response");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_messages_accepted_in_one_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut data = [0u8; 10];
            stream.read_exact(&mut data).await.unwrap();
            assert_eq!(&data, b"firstsecon");
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = TcpMessageStream::new(stream);

        let first_buffers = [IoSlice::new(b"first")];
        let second_buffers = [IoSlice::new(b"secon")];
        let messages = [
            OutboundMessage::new(&first_buffers, None),
            OutboundMessage::new(&second_buffers, None),
        ];
        assert_eq!(send_messages(&mut stream, &messages).await.unwrap(), 2);
        shutdown_messages(&mut stream).await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = TcpMessageStream::new(stream);

        let payload = vec![0u8; WRITE_BUFFER_LEN + 1];
        let buffers = [IoSlice::new(&payload)];
        let message = OutboundMessage::new(&buffers, None);
        let err = send_messages(&mut stream, &[message]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_eof_reports_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = TcpMessageStream::new(stream);

        let (server_stream, _) = listener.accept().await.unwrap();
        drop(server_stream);

        let mut data = [0u8; 64];
        let mut bufs = [ReadBuf::new(&mut data)];
        assert_eq!(recv_messages(&mut stream, &mut bufs).await.unwrap(), 0);
    }
}
