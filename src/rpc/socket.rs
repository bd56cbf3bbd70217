//! Datagram layer managing incoming/outgoing requests and responses.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::messages::{
    ErrorSpecific, Message, MessageBody, RequestSpecific, ResponseSpecific,
};

const RECV_BUFFER_SIZE: usize = 64 * 1024;
const UDP_SOCKET_BUFFER_SIZE: i32 = 2 * 1024 * 1024; // 2MB

/// The port the node tries first when none is configured.
pub const DEFAULT_PORT: u16 = 5160;
/// Default request timeout before abandoning an inflight request to a
/// non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// What the node requires of a datagram transport: best-effort delivery and
/// a non-blocking receive. The node never assumes a send arrived.
pub trait Transport: Send + Debug {
    /// Deliver bytes to the address, best effort.
    fn send(&mut self, to: SocketAddrV4, bytes: &[u8]) -> io::Result<()>;

    /// Receive one datagram if available; returns None when there is nothing
    /// to read right now.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>>;

    /// The address this transport is reachable at.
    fn local_addr(&self) -> SocketAddrV4;
}

#[derive(Debug)]
/// The default [Transport]: a non-blocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl UdpTransport {
    /// Binds the explicit port, or [DEFAULT_PORT] falling back to an
    /// OS-assigned port when taken.
    pub fn bind(port: Option<u16>) -> io::Result<UdpTransport> {
        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        // Increase OS-level UDP socket buffers to prevent packet loss under
        // high throughput; the default (~128KB) is often too small for DHT
        // traffic at scale.
        set_socket_buffers(&socket, UDP_SOCKET_BUFFER_SIZE)?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        };

        socket.set_nonblocking(true)?;

        Ok(UdpTransport { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, to: SocketAddrV4, bytes: &[u8]) -> io::Result<()> {
        self.socket.send_to(bytes, to)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
        match self.socket.recv_from(buf) {
            Ok((amt, SocketAddr::V4(from))) => Ok(Some((amt, from))),
            Ok((_, SocketAddr::V6(_))) => {
                trace!(context = "socket_validation", "Received IPv6 packet");
                Ok(None)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_micros(100)); // yield for a bit
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
}

/// A [Transport] wrapper that formats and correlates requests and responses.
#[derive(Debug)]
pub struct RpcSocket {
    next_tid: u16,
    transport: Box<dyn Transport>,
    request_timeout: Duration,
    inflight_requests: BTreeMap<u16, InflightRequest>,
}

#[derive(Debug)]
struct InflightRequest {
    to: SocketAddrV4,
    sent_at: Instant,
}

impl RpcSocket {
    pub fn new(transport: Box<dyn Transport>, request_timeout: Duration) -> RpcSocket {
        RpcSocket {
            next_tid: 0,
            transport,
            request_timeout,
            inflight_requests: BTreeMap::new(),
        }
    }

    // === Getters ===

    /// Returns the address the node is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.transport.local_addr()
    }

    /// Returns true if this transaction_id is still inflight.
    pub fn inflight(&self, transaction_id: &u16) -> bool {
        self.inflight_requests.contains_key(transaction_id)
    }

    // === Public Methods ===

    /// Send a request to the given address and return the transaction_id.
    pub fn request(&mut self, address: SocketAddrV4, request: RequestSpecific) -> u16 {
        let transaction_id = self.tid();
        let message = Message {
            transaction_id,
            body: MessageBody::Request(request),
        };
        trace!(context = "socket_message_sending", ?message);

        self.inflight_requests.insert(
            transaction_id,
            InflightRequest {
                to: address,
                sent_at: Instant::now(),
            },
        );

        self.send(address, message);
        transaction_id
    }

    /// Send a response to the given address. Transmit and forget: responses
    /// are never tracked.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        self.send(
            address,
            Message {
                transaction_id,
                body: MessageBody::Response(response),
            },
        );
    }

    /// Send an error to the given address.
    pub fn error(&mut self, address: SocketAddrV4, transaction_id: u16, error: ErrorSpecific) {
        self.send(
            address,
            Message {
                transaction_id,
                body: MessageBody::Error(error),
            },
        );
    }

    /// Remove and return the transaction ids of requests whose timeout has
    /// passed without a response, releasing their correlation slots.
    pub fn take_expired(&mut self) -> Vec<u16> {
        let timeout = self.request_timeout;

        let expired: Vec<u16> = self
            .inflight_requests
            .iter()
            .filter(|(_, request)| request.sent_at.elapsed() > timeout)
            .map(|(tid, _)| *tid)
            .collect();

        for tid in &expired {
            self.inflight_requests.remove(tid);
        }

        expired
    }

    /// Receives a single message on the transport.
    /// On success, returns the message and its origin.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0_u8; RECV_BUFFER_SIZE];

        let (amt, from) = match self.transport.recv(&mut buf) {
            Ok(Some(received)) => received,
            Ok(None) => return None,
            Err(e) => {
                trace!(context = "socket_error", ?e, "recv failed unexpectedly");
                return None;
            }
        };

        if from.port() == 0 {
            trace!(context = "socket_validation", "Message from port 0");
            return None;
        }

        let bytes = &buf[..amt];

        match Message::from_bytes(bytes) {
            Ok(message) => {
                let expected = match &message.body {
                    MessageBody::Request(_) => true,
                    MessageBody::Response(_) | MessageBody::Error(_) => {
                        self.is_expected_response(&message, &from)
                    }
                };

                if expected {
                    trace!(context = "socket_message_receiving", ?message, ?from);
                    return Some((message, from));
                }
            }
            Err(error) => {
                debug!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received malformed message, dropping."
                );
            }
        }

        None
    }

    // === Private Methods ===

    /// A response is only accepted when its transaction id claims a live
    /// correlation slot and it originates from the peer that slot was
    /// opened for. Either way the slot is consumed.
    fn is_expected_response(&mut self, message: &Message, from: &SocketAddrV4) -> bool {
        let Some(request) = self.inflight_requests.remove(&message.transaction_id) else {
            trace!(
                context = "socket_validation",
                "Response id matches no inflight request"
            );
            return false;
        };

        let matches = reply_origin_matches(&request.to, from);
        if !matches {
            trace!(context = "socket_validation", "Response origin mismatch");
        }
        matches
    }

    /// Hands out the next transaction id, wrapping at the u16 boundary.
    /// Expired ids are never recycled: a slot lives for a couple of
    /// seconds at most, long gone by the time the counter comes around.
    fn tid(&mut self) -> u16 {
        let next = self.next_tid.wrapping_add(1);
        std::mem::replace(&mut self.next_tid, next)
    }

    fn send(&mut self, address: SocketAddrV4, message: Message) {
        match message.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(address, &bytes) {
                    debug!(?e, "Error sending message");
                }
            }
            Err(e) => {
                debug!(?e, "Error encoding message");
            }
        }
    }
}

/// Whether a reply's source matches the destination its request went to:
/// the ports must agree, and so must the ips, except that a request
/// addressed to 0.0.0.0 (as tests do) accepts a reply from any ip.
fn reply_origin_matches(to: &SocketAddrV4, from: &SocketAddrV4) -> bool {
    to.port() == from.port() && (to.ip().is_unspecified() || to.ip() == from.ip())
}

#[cfg(unix)]
fn set_socket_buffers(socket: &UdpSocket, size: i32) -> io::Result<()> {
    use libc::{setsockopt, SOL_SOCKET, SO_RCVBUF, SO_SNDBUF};
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();

    for option in [SO_RCVBUF, SO_SNDBUF] {
        let result = unsafe {
            setsockopt(
                fd,
                SOL_SOCKET,
                option,
                &size as *const _ as *const _,
                std::mem::size_of_val(&size) as u32,
            )
        };

        if result != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn set_socket_buffers(_socket: &UdpSocket, _size: i32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory [Transport] for deterministic tests: datagrams go through
    /// flume channels instead of a socket.
    #[derive(Debug)]
    pub(crate) struct ChannelTransport {
        local_addr: SocketAddrV4,
        inbound: flume::Receiver<(Vec<u8>, SocketAddrV4)>,
        outbound: flume::Sender<(Vec<u8>, SocketAddrV4)>,
    }

    /// The test's end of a [ChannelTransport].
    pub(crate) struct TestWire {
        pub inbound: flume::Sender<(Vec<u8>, SocketAddrV4)>,
        pub outbound: flume::Receiver<(Vec<u8>, SocketAddrV4)>,
    }

    impl TestWire {
        /// Next datagram the node sent, parsed.
        pub fn recv_message(&self) -> Option<(Message, SocketAddrV4)> {
            self.outbound
                .try_recv()
                .ok()
                .map(|(bytes, to)| (Message::from_bytes(&bytes).unwrap(), to))
        }

        /// Deliver a message to the node as if it came from `from`.
        pub fn send_message(&self, message: &Message, from: SocketAddrV4) {
            self.inbound
                .send((message.to_bytes().unwrap(), from))
                .unwrap();
        }
    }

    pub(crate) fn channel_transport(port: u16) -> (ChannelTransport, TestWire) {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let (outbound_tx, outbound_rx) = flume::unbounded();

        (
            ChannelTransport {
                local_addr: SocketAddrV4::new([127, 0, 0, 1].into(), port),
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            TestWire {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }

    impl Transport for ChannelTransport {
        fn send(&mut self, to: SocketAddrV4, bytes: &[u8]) -> io::Result<()> {
            let _ = self.outbound.send((bytes.to_vec(), to));
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
            match self.inbound.try_recv() {
                Ok((bytes, from)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(Some((bytes.len(), from)))
                }
                Err(_) => Ok(None),
            }
        }

        fn local_addr(&self) -> SocketAddrV4 {
            self.local_addr
        }
    }
}
