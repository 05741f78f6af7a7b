use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use log::{debug, warn};
use tokio::io::ReadBuf;

use crate::message_socket::{
    send_messages, AsyncMessageSocket, AsyncRecvMessages, AsyncSendMessages,
    AsyncShutdownMessages, OutboundMessage, SocketInfo,
};

// Fixed byte patterns impersonating an SSLv2-compatible handshake. These are
// literal constants: traffic-inspecting middleboxes match on the exact bytes,
// so changing even one breaks interoperability.
const SSL_SERVER_HANDSHAKE: [u8; 79] = [
    0x16, 0x03, 0x01, 0x00, 0x4a, 0x02, 0x00, 0x00, //
    0x46, 0x03, 0x01, 0x42, 0x85, 0x45, 0xa7, 0x27, //
    0xa9, 0x5d, 0xa0, 0xb3, 0xc5, 0xe7, 0x53, 0xda, //
    0x48, 0x2b, 0x3f, 0xc6, 0x5a, 0xca, 0x89, 0xc1, //
    0x58, 0x52, 0xa1, 0x78, 0x3c, 0x5b, 0x17, 0x46, //
    0x00, 0x85, 0x3f, 0x20, 0x0e, 0xd3, 0x06, 0x72, //
    0x5b, 0x5b, 0x1b, 0x5f, 0x15, 0xac, 0x13, 0xf9, //
    0x88, 0x53, 0x9d, 0x9b, 0xe8, 0x3d, 0x7b, 0x0c, //
    0x30, 0x32, 0x6e, 0x38, 0x4d, 0xa2, 0x75, 0x57, //
    0x41, 0x6c, 0x34, 0x5c, 0x00, 0x04, 0x00,
];

const SSL_CLIENT_HANDSHAKE: [u8; 72] = [
    0x80, 0x46, 0x01, 0x03, 0x01, 0x00, 0x2d, 0x00, //
    0x00, 0x00, 0x10, 0x01, 0x00, 0x80, 0x03, 0x00, //
    0x80, 0x07, 0x00, 0xc0, 0x06, 0x00, 0x40, 0x02, //
    0x00, 0x80, 0x04, 0x00, 0x80, 0x00, 0x00, 0x04, //
    0x00, 0xfe, 0xff, 0x00, 0x00, 0x0a, 0x00, 0xfe, //
    0xfe, 0x00, 0x00, 0x09, 0x00, 0x00, 0x64, 0x00, //
    0x00, 0x62, 0x00, 0x00, 0x03, 0x00, 0x00, 0x06, //
    0x1f, 0x17, 0x0c, 0xa6, 0x2f, 0x00, 0x78, 0xfc, //
    0x46, 0x55, 0x2e, 0xb1, 0x83, 0x39, 0xf1, 0xea,
];

struct PendingSend {
    payload: Box<[u8]>,
    destination: Option<SocketAddr>,
}

/// A decorator that makes a TCP relay connection traversable through
/// middleboxes that only forward traffic resembling an SSL handshake.
///
/// On construction it sends a fixed client-handshake pattern to the wrapped
/// socket. Until the matching server pattern arrives, outbound messages are
/// queued rather than transmitted; the first inbound message is intercepted
/// and compared byte-for-byte against the expected pattern. On a match the
/// queue is flushed in order and all further traffic passes straight through.
/// On a mismatch the wrapped socket is released and the connection can never
/// recover.
///
/// Known limitation, preserved deliberately: sends issued before the
/// handshake completes are reported as accepted even though delivery is not
/// confirmed, and is never confirmed later. If the peer never completes the
/// handshake, queued sends accumulate until the stream is shut down; bounding
/// that is the owning layer's responsibility.
pub struct PseudoSslMessageStream {
    handshaken: bool,
    inner: Option<Box<dyn AsyncMessageSocket>>,
    pending: VecDeque<PendingSend>,
}

impl PseudoSslMessageStream {
    /// Wraps an already-connected reliable socket and immediately submits the
    /// client-side handshake pattern.
    ///
    /// The handshake send is fire-and-forget: a failure is logged and
    /// otherwise ignored, surfacing later through read failures.
    pub async fn new(mut inner: Box<dyn AsyncMessageSocket>) -> Self {
        // Destination is None: the wrapped socket is already connected and
        // ignores routing information.
        let buffers = [IoSlice::new(&SSL_CLIENT_HANDSHAKE)];
        let handshake = OutboundMessage::new(&buffers, None);
        if let Err(e) = send_messages(&mut inner, &[handshake]).await {
            debug!("Failed to send pseudo-SSL client handshake: {}", e);
        }
        Self {
            handshaken: false,
            inner: Some(inner),
            pending: VecDeque::new(),
        }
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken
    }

    /// Pushes queued entries to the wrapped socket in FIFO order. Entries the
    /// transport does not accept right away stay queued and are retried by
    /// later send/recv calls.
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while let Some(entry) = self.pending.front() {
            let inner = match self.inner.as_mut() {
                Some(inner) => inner,
                None => {
                    // No socket left to deliver to.
                    self.pending.clear();
                    break;
                }
            };
            let buffers = [IoSlice::new(&entry.payload)];
            let message = OutboundMessage {
                buffers: &buffers,
                length: entry.payload.len(),
                destination: entry.destination,
            };
            match Pin::new(inner).poll_send_messages(cx, std::slice::from_ref(&message)) {
                Poll::Ready(Ok(accepted)) => {
                    if accepted == 0 {
                        return Poll::Pending;
                    }
                    self.pending.pop_front();
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
                Poll::Ready(Err(e)) => {
                    // The flush is fire-and-forget, matching the send-side
                    // contract that already reported these messages accepted.
                    // The transport failure surfaces through later reads.
                    debug!("Dropping queued send after transport failure: {}", e);
                    self.pending.pop_front();
                }
            }
        }
        Poll::Ready(())
    }
}

impl AsyncRecvMessages for PseudoSslMessageStream {
    fn poll_recv_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &mut [ReadBuf<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.handshaken {
            if !this.pending.is_empty() {
                // Make forward progress on entries still queued from the
                // handshake flush; reads do not wait on them.
                let _ = this.poll_drain_pending(cx);
            }
            // Fast path: once the handshake is done, pass straight through to
            // the wrapped socket.
            return match this.inner.as_mut() {
                Some(inner) => Pin::new(inner).poll_recv_messages(cx, bufs),
                None => Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "socket released",
                ))),
            };
        }

        let inner = match this.inner.as_mut() {
            Some(inner) => inner,
            // Poisoned: nothing to deliver, but also not a crash.
            None => return Poll::Ready(Ok(0)),
        };

        let mut data = [0u8; SSL_SERVER_HANDSHAKE.len()];
        let mut local_buf = ReadBuf::new(&mut data);
        let received = ready!(
            Pin::new(inner).poll_recv_messages(cx, std::slice::from_mut(&mut local_buf))
        )?;
        if received == 0 {
            return Poll::Ready(Ok(0));
        }

        if received == 1 && local_buf.filled() == &SSL_SERVER_HANDSHAKE[..] {
            debug!("Pseudo-SSL handshake complete, flushing queued sends");
            this.handshaken = true;
            // Entries the transport does not accept within this call stay
            // queued and are drained by subsequent calls, still in order.
            let _ = this.poll_drain_pending(cx);
            // The consumed bytes were protocol overhead, not application
            // data.
            return Poll::Ready(Ok(0));
        }

        warn!(
            "Unexpected pseudo-SSL server handshake ({} bytes), dropping connection",
            local_buf.filled().len()
        );
        this.inner = None;
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid pseudo-SSL server handshake",
        )))
    }
}

impl AsyncSendMessages for PseudoSslMessageStream {
    fn poll_send_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        messages: &[OutboundMessage<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.handshaken {
            // Queued entries go first so submission order is preserved.
            ready!(this.poll_drain_pending(cx));
            return match this.inner.as_mut() {
                Some(inner) => Pin::new(inner).poll_send_messages(cx, messages),
                None => Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "socket released",
                ))),
            };
        }

        if this.inner.is_none() {
            // Poisoned before the handshake completed: these writes could
            // never be delivered.
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "pseudo-SSL handshake failed",
            )));
        }

        for message in messages {
            this.pending.push_back(PendingSend {
                payload: message.to_contiguous(),
                destination: message.destination,
            });
        }
        // Optimistic accept: the writes are queued, not transmitted, and are
        // reported as accepted without delivery confirmation.
        Poll::Ready(Ok(messages.len()))
    }
}

impl AsyncShutdownMessages for PseudoSslMessageStream {
    fn poll_shutdown_messages(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        // Undelivered queued writes are discarded, never sent.
        this.pending.clear();
        let result = match this.inner.as_mut() {
            Some(inner) => ready!(Pin::new(inner).poll_shutdown_messages(cx)),
            None => Ok(()),
        };
        this.inner = None;
        Poll::Ready(result)
    }
}

impl SocketInfo for PseudoSslMessageStream {
    fn is_reliable(&self) -> bool {
        // Static property, independent of handshake state.
        true
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self.inner.as_ref() {
            Some(inner) => inner.local_addr(),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "socket released",
            )),
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        self.inner.as_ref().and_then(|inner| inner.raw_fd())
    }
}

impl AsyncMessageSocket for PseudoSslMessageStream {}
