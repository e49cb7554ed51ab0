//! Shard-local polled TCP message transport.
//!
//! One `Transport` lives on each shard and is never shared across threads.
//! Connections are opened lazily per endpoint URL and driven entirely by
//! polling: nothing here blocks except inside an explicit deadline, and no
//! internal threads exist. Inbound one-way frames are dispatched to
//! observers registered by verb.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::wire::{extract_frame, FrameHeader, FrameKind, Verb, FRAME_HDR_SIZE};

/// Timeout for establishing a connection when no request deadline applies.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Payload allocations above this size fire the low-memory observer.
const PAYLOAD_HIGH_WATER: usize = 16 * 1024 * 1024;

/// An owned message payload.
///
/// Created through [`Transport::new_payload`], filled by the producer, and
/// moved into the send calls.
#[derive(Debug, Default)]
pub struct Payload {
    buf: Vec<u8>,
}

impl Payload {
    fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    /// Wrap an already-filled buffer.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Append bytes.
    #[inline]
    pub fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The payload contents.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Payload size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Observer for inbound one-way messages, keyed by verb.
pub type MessageObserver = Box<dyn FnMut(Payload)>;

/// Observer fired when a payload allocation crosses the high-water mark.
pub type LowMemoryObserver = Box<dyn FnMut(usize)>;

struct Conn {
    stream: TcpStream,
    rx: Vec<u8>,
}

impl Conn {
    fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&endpoint.addr(), timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self { stream, rx: Vec::new() })
    }

    /// Pull whatever the kernel has buffered. Returns true if the peer has
    /// closed the connection.
    fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.rx.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        return Ok(false);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drain all complete frames out of the receive buffer.
    fn drain_frames(&mut self, out: &mut Vec<(FrameHeader, Vec<u8>)>) -> Result<()> {
        while let Some(frame) = extract_frame(&mut self.rx)? {
            out.push(frame);
        }
        Ok(())
    }
}

/// Shard-local message transport.
pub struct Transport {
    conns: RefCell<HashMap<String, Rc<RefCell<Conn>>>>,
    observers: RefCell<HashMap<Verb, MessageObserver>>,
    low_memory: RefCell<Option<LowMemoryObserver>>,
    next_seq: Cell<u64>,
    shut_down: Cell<bool>,
}

impl Transport {
    /// Create a transport with no open connections.
    pub fn new() -> Self {
        Self {
            conns: RefCell::new(HashMap::new()),
            observers: RefCell::new(HashMap::new()),
            low_memory: RefCell::new(None),
            next_seq: Cell::new(1),
            shut_down: Cell::new(false),
        }
    }

    /// Parse a URL into an endpoint handle. No connection is made until the
    /// endpoint is first used.
    pub fn endpoint(&self, url: &str) -> Result<Endpoint> {
        Endpoint::parse(url)
    }

    /// Allocate a payload buffer.
    pub fn new_payload(&self, capacity: usize) -> Payload {
        if capacity > PAYLOAD_HIGH_WATER {
            if let Some(observer) = self.low_memory.borrow_mut().as_mut() {
                observer(capacity);
            }
        }
        Payload::with_capacity(capacity)
    }

    /// Install or remove the observer for a verb's one-way messages.
    pub fn register_observer(&self, verb: Verb, observer: Option<MessageObserver>) {
        let mut observers = self.observers.borrow_mut();
        match observer {
            Some(observer) => {
                observers.insert(verb, observer);
            }
            None => {
                observers.remove(&verb);
            }
        }
    }

    /// Install or remove the low-memory observer.
    pub fn register_low_memory_observer(&self, observer: Option<LowMemoryObserver>) {
        *self.low_memory.borrow_mut() = observer;
    }

    /// Tear down: drop all connections; subsequent operations fail with
    /// [`Error::TransportShutdown`].
    pub fn shutdown(&self) {
        self.shut_down.set(true);
        self.conns.borrow_mut().clear();
    }

    /// Whether [`Transport::shutdown`] has been called.
    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.get()
    }

    fn check_open(&self) -> Result<()> {
        if self.shut_down.get() {
            return Err(Error::TransportShutdown);
        }
        Ok(())
    }

    fn conn_for(&self, endpoint: &Endpoint, connect_timeout: Duration) -> Result<Rc<RefCell<Conn>>> {
        if let Some(conn) = self.conns.borrow().get(endpoint.url()) {
            return Ok(Rc::clone(conn));
        }
        let conn = Rc::new(RefCell::new(Conn::connect(endpoint, connect_timeout)?));
        self.conns
            .borrow_mut()
            .insert(endpoint.url().to_string(), Rc::clone(&conn));
        Ok(conn)
    }

    fn drop_conn(&self, endpoint: &Endpoint) {
        self.conns.borrow_mut().remove(endpoint.url());
    }

    /// Round-trip RPC: send a request frame and wait for the matching
    /// response, dispatching any unrelated inbound frames along the way.
    /// The timeout bounds connection establishment and the wait combined.
    pub fn send_request(
        &self,
        verb: Verb,
        payload: Payload,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Payload> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;
        let conn = self.conn_for(endpoint, timeout)?;
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        let hdr = FrameHeader::request(verb, seq, payload.len());
        if let Err(e) = self.write_frame(&conn, &hdr, payload.bytes(), Some(deadline)) {
            self.drop_conn(endpoint);
            return Err(e);
        }

        let mut inbound = Vec::new();
        loop {
            let closed = {
                let mut c = conn.borrow_mut();
                let closed = c.fill()?;
                c.drain_frames(&mut inbound)?;
                closed
            };

            let mut response = None;
            for (h, body) in inbound.drain(..) {
                if h.kind == FrameKind::Response && h.seq == seq {
                    response = Some(body);
                } else {
                    self.dispatch(h, body);
                }
            }
            if let Some(body) = response {
                return Ok(Payload::from_vec(body));
            }
            if closed {
                self.drop_conn(endpoint);
                return Err(Error::TransportShutdown);
            }
            if Instant::now() >= deadline {
                return Err(Error::RequestTimeout);
            }
            std::thread::yield_now();
        }
    }

    /// One-way send. Completes once the bytes are handed to the kernel;
    /// never waits for the peer.
    pub fn send(&self, verb: Verb, payload: Payload, endpoint: &Endpoint) -> Result<()> {
        self.check_open()?;
        let conn = self.conn_for(endpoint, CONNECT_TIMEOUT)?;
        let hdr = FrameHeader::oneway(verb, payload.len());
        self.write_frame(&conn, &hdr, payload.bytes(), None)
    }

    /// Non-blocking drain of every connection, dispatching inbound frames
    /// to their observers. Returns the number of frames dispatched.
    pub fn poll(&self) -> Result<usize> {
        self.check_open()?;
        let conns: Vec<(String, Rc<RefCell<Conn>>)> = self
            .conns
            .borrow()
            .iter()
            .map(|(url, conn)| (url.clone(), Rc::clone(conn)))
            .collect();

        let mut events = 0;
        let mut inbound = Vec::new();
        let mut lost = false;
        for (url, conn) in conns {
            let closed = {
                let mut c = conn.borrow_mut();
                let closed = c.fill()?;
                c.drain_frames(&mut inbound)?;
                closed
            };
            for (h, body) in inbound.drain(..) {
                self.dispatch(h, body);
                events += 1;
            }
            if closed {
                warn!(url = url.as_str(), "peer closed connection");
                self.conns.borrow_mut().remove(&url);
                lost = true;
            }
        }
        if lost {
            return Err(Error::TransportShutdown);
        }
        Ok(events)
    }

    fn dispatch(&self, hdr: FrameHeader, body: Vec<u8>) {
        match hdr.kind {
            FrameKind::Oneway => {
                let mut observers = self.observers.borrow_mut();
                if let Some(observer) = observers.get_mut(&hdr.verb) {
                    observer(Payload::from_vec(body));
                } else {
                    warn!(verb = hdr.verb, "dropping message with no observer");
                }
            }
            FrameKind::Response => {
                warn!(verb = hdr.verb, seq = hdr.seq, "dropping unexpected response");
            }
            FrameKind::Request => {
                warn!(verb = hdr.verb, "dropping inbound request; this endpoint does not serve");
            }
        }
    }

    /// Write a full frame, draining inbound data whenever the kernel send
    /// buffer pushes back so acks keep flowing while we wait.
    fn write_frame(
        &self,
        conn: &Rc<RefCell<Conn>>,
        hdr: &FrameHeader,
        body: &[u8],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut frame = Vec::with_capacity(FRAME_HDR_SIZE + body.len());
        frame.extend_from_slice(&hdr.to_bytes());
        frame.extend_from_slice(body);

        let mut off = 0;
        let mut inbound = Vec::new();
        while off < frame.len() {
            let stalled = {
                let mut c = conn.borrow_mut();
                match c.stream.write(&frame[off..]) {
                    Ok(0) => return Err(Error::TransportShutdown),
                    Ok(n) => {
                        off += n;
                        false
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if c.fill()? {
                            return Err(Error::TransportShutdown);
                        }
                        c.drain_frames(&mut inbound)?;
                        true
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => false,
                    Err(e) => return Err(e.into()),
                }
            };
            for (h, b) in inbound.drain(..) {
                self.dispatch(h, b);
            }
            if stalled {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return Err(Error::RequestTimeout);
                    }
                }
                std::hint::spin_loop();
            }
        }
        Ok(())
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}
