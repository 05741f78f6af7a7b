//! pseudossl - a pseudo-SSL socket decorator for TCP relay traversal.
//!
//! Some NAT/firewall middleboxes only forward TCP traffic that looks like an
//! SSL handshake. [`PseudoSslMessageStream`] wraps an already-connected
//! message socket, exchanges a fixed byte pattern impersonating an SSLv2
//! handshake, and then passes all traffic straight through. This is the
//! traversal trick used by TURN-over-TCP relays; no cryptography is involved
//! and the exchanged bytes are not a negotiated protocol.
//!
//! The decorator implements the same [`AsyncMessageSocket`] contract as the
//! socket it wraps, so it is substitutable anywhere a plain socket is
//! expected. [`TcpMessageStream`] adapts a `tokio::net::TcpStream` to that
//! contract.

mod message_socket;
mod pseudo_ssl_message_stream;
mod tcp_message_stream;
mod util;

pub use message_socket::{
    recv_messages, send_messages, shutdown_messages, AsyncMessageSocket, AsyncRecvMessages,
    AsyncSendMessages, AsyncShutdownMessages, OutboundMessage, SocketInfo,
};
pub use pseudo_ssl_message_stream::PseudoSslMessageStream;
pub use tcp_message_stream::TcpMessageStream;
