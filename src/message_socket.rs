use std::io::IoSlice;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

/// A single outbound message: an ordered set of byte ranges treated as one
/// logical contiguous payload, optionally addressed.
///
/// `length` is the caller's declared total payload length. Implementations
/// never consume more than `length` bytes from `buffers`, even when the
/// buffers sum to more. The buffers must provide at least `length` bytes.
pub struct OutboundMessage<'a> {
    pub buffers: &'a [IoSlice<'a>],
    pub length: usize,
    /// Ignored by connected stream transports, which already know their peer.
    pub destination: Option<SocketAddr>,
}

impl<'a> OutboundMessage<'a> {
    /// Creates a message whose declared length is the sum of the buffer sizes.
    pub fn new(buffers: &'a [IoSlice<'a>], destination: Option<SocketAddr>) -> Self {
        let length = buffers.iter().map(|buffer| buffer.len()).sum();
        Self {
            buffers,
            length,
            destination,
        }
    }

    /// Compacts the scattered buffers into a single owned buffer of exactly
    /// the declared length, copying in order and stopping once the declared
    /// length is reached.
    pub fn to_contiguous(&self) -> Box<[u8]> {
        let mut payload = Vec::with_capacity(self.length);
        for buffer in self.buffers {
            if payload.len() == self.length {
                break;
            }
            let len = std::cmp::min(self.length - payload.len(), buffer.len());
            payload.extend_from_slice(&buffer[..len]);
        }
        debug_assert_eq!(payload.len(), self.length);
        payload.into_boxed_slice()
    }
}

pub trait AsyncRecvMessages {
    /// Delivers zero or more already-received messages into `bufs`, one
    /// message per buffer, returning the count delivered.
    ///
    /// `Ready(Ok(0))` means there is nothing to deliver and is not an error.
    /// `Pending` means the underlying transport would block.
    fn poll_recv_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &mut [ReadBuf<'_>],
    ) -> Poll<std::io::Result<usize>>;
}

pub trait AsyncSendMessages {
    /// Accepts zero or more messages for transmission, returning the count
    /// accepted. Implementations return `Pending` rather than `Ready(Ok(0))`
    /// when they cannot accept any message from a non-empty batch.
    fn poll_send_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        messages: &[OutboundMessage<'_>],
    ) -> Poll<std::io::Result<usize>>;
}

pub trait AsyncShutdownMessages {
    /// Flushes and releases the transport. Idempotent; dropping the socket
    /// releases everything as well.
    fn poll_shutdown_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>>;
}

pub trait SocketInfo {
    /// Whether the transport guarantees ordered, lossless delivery.
    fn is_reliable(&self) -> bool;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd>;
}

pub trait AsyncMessageSocket:
    AsyncRecvMessages + AsyncSendMessages + AsyncShutdownMessages + SocketInfo + Unpin + Send
{
}

impl AsyncRecvMessages for UdpSocket {
    fn poll_recv_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &mut [ReadBuf<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let mut received = 0;
        for buf in bufs.iter_mut() {
            match this.poll_recv(cx, buf) {
                Poll::Ready(Ok(())) => received += 1,
                Poll::Pending => {
                    if received == 0 {
                        return Poll::Pending;
                    }
                    break;
                }
                Poll::Ready(Err(e)) => {
                    if received == 0 {
                        return Poll::Ready(Err(e));
                    }
                    break;
                }
            }
        }
        Poll::Ready(Ok(received))
    }
}

impl AsyncSendMessages for UdpSocket {
    fn poll_send_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        messages: &[OutboundMessage<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let mut sent = 0;
        for message in messages {
            let compacted;
            let payload: &[u8] = match message.buffers {
                [single] if single.len() >= message.length => &single[..message.length],
                _ => {
                    compacted = message.to_contiguous();
                    &compacted
                }
            };
            let result = match message.destination {
                Some(destination) => this.poll_send_to(cx, payload, destination),
                None => this.poll_send(cx, payload),
            };
            match result {
                Poll::Ready(Ok(_)) => sent += 1,
                Poll::Pending => {
                    if sent == 0 {
                        return Poll::Pending;
                    }
                    break;
                }
                Poll::Ready(Err(e)) => {
                    if sent == 0 {
                        return Poll::Ready(Err(e));
                    }
                    break;
                }
            }
        }
        Poll::Ready(Ok(sent))
    }
}

impl AsyncShutdownMessages for UdpSocket {
    fn poll_shutdown_messages(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl SocketInfo for UdpSocket {
    fn is_reliable(&self) -> bool {
        false
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl AsyncMessageSocket for UdpSocket {}

// pattern copied from deref_async_read macro: https://docs.rs/tokio/latest/src/tokio/io/async_read.rs.html#60
impl<T: ?Sized + AsyncRecvMessages + Unpin> AsyncRecvMessages for Box<T> {
    fn poll_recv_messages(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &mut [ReadBuf<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut **self).poll_recv_messages(cx, bufs)
    }
}

impl<T: ?Sized + AsyncRecvMessages + Unpin> AsyncRecvMessages for &mut T {
    fn poll_recv_messages(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &mut [ReadBuf<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut **self).poll_recv_messages(cx, bufs)
    }
}

impl<T: ?Sized + AsyncSendMessages + Unpin> AsyncSendMessages for Box<T> {
    fn poll_send_messages(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        messages: &[OutboundMessage<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut **self).poll_send_messages(cx, messages)
    }
}

impl<T: ?Sized + AsyncSendMessages + Unpin> AsyncSendMessages for &mut T {
    fn poll_send_messages(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        messages: &[OutboundMessage<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut **self).poll_send_messages(cx, messages)
    }
}

impl<T: ?Sized + AsyncShutdownMessages + Unpin> AsyncShutdownMessages for Box<T> {
    fn poll_shutdown_messages(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self).poll_shutdown_messages(cx)
    }
}

impl<T: ?Sized + AsyncShutdownMessages + Unpin> AsyncShutdownMessages for &mut T {
    fn poll_shutdown_messages(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self).poll_shutdown_messages(cx)
    }
}

impl<T: ?Sized + SocketInfo> SocketInfo for Box<T> {
    fn is_reliable(&self) -> bool {
        (**self).is_reliable()
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        (**self).local_addr()
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        (**self).raw_fd()
    }
}

impl<T: ?Sized + SocketInfo> SocketInfo for &mut T {
    fn is_reliable(&self) -> bool {
        (**self).is_reliable()
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        (**self).local_addr()
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        (**self).raw_fd()
    }
}

impl<T: ?Sized + AsyncMessageSocket + Unpin> AsyncMessageSocket for Box<T> {}
impl<T: ?Sized + AsyncMessageSocket + Unpin> AsyncMessageSocket for &mut T {}

/// Awaits a single `poll_recv_messages` call.
pub async fn recv_messages<S>(
    socket: &mut S,
    bufs: &mut [ReadBuf<'_>],
) -> std::io::Result<usize>
where
    S: AsyncRecvMessages + Unpin + ?Sized,
{
    futures::future::poll_fn(|cx| Pin::new(&mut *socket).poll_recv_messages(cx, &mut *bufs)).await
}

/// Awaits a single `poll_send_messages` call.
pub async fn send_messages<S>(
    socket: &mut S,
    messages: &[OutboundMessage<'_>],
) -> std::io::Result<usize>
where
    S: AsyncSendMessages + Unpin + ?Sized,
{
    futures::future::poll_fn(|cx| Pin::new(&mut *socket).poll_send_messages(cx, messages)).await
}

/// Awaits shutdown of the transport.
pub async fn shutdown_messages<S>(socket: &mut S) -> std::io::Result<()>
where
    S: AsyncShutdownMessages + Unpin + ?Sized,
{
    futures::future::poll_fn(|cx| Pin::new(&mut *socket).poll_shutdown_messages(cx)).await
}
