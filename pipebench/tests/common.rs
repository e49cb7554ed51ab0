//! Shared test harness: a minimal in-process ack server over loopback TCP.
//!
//! The server speaks just enough of the protocol to drive the client end to
//! end: it answers `GET_DATA_URL` with its own URL (optionally replying
//! empty a configured number of times first), answers `START_SESSION` with
//! a fixed session id, counts inbound `REQUEST` messages, and emits a
//! cumulative `ACK` every `ack_count` requests.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pipebench::config::SessionConfig;
use pipebench::wire::{
    self, Ack, FrameHeader, FrameKind, RequestHeader, SessionAck, FRAME_HDR_SIZE,
};

pub struct TestServer {
    url: String,
    stop: Arc<AtomicBool>,
    discovery_requests: Arc<AtomicU64>,
    accept_thread: Option<JoinHandle<()>>,
}

pub const TEST_SESSION_ID: u64 = 0xBE5517;

impl TestServer {
    /// Start a server; the first `empty_discovery_replies` discovery
    /// requests get an empty response.
    pub fn start(empty_discovery_replies: u64) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let port = listener.local_addr().expect("local addr").port();
        let url = format!("tcp://127.0.0.1:{port}");

        let stop = Arc::new(AtomicBool::new(false));
        let discovery_requests = Arc::new(AtomicU64::new(0));

        let accept_stop = Arc::clone(&stop);
        let accept_discovery = Arc::clone(&discovery_requests);
        let accept_url = url.clone();
        let accept_thread = std::thread::spawn(move || {
            let mut workers = Vec::new();
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let stop = Arc::clone(&accept_stop);
                        let discovery = Arc::clone(&accept_discovery);
                        let url = accept_url.clone();
                        workers.push(std::thread::spawn(move || {
                            serve_conn(stream, &stop, &discovery, &url, empty_discovery_replies);
                        }));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if accept_stop.load(Ordering::SeqCst) {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
            for worker in workers {
                let _ = worker.join();
            }
        });

        TestServer {
            url,
            stop,
            discovery_requests,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// How many discovery requests the server has seen.
    pub fn discovery_requests(&self) -> u64 {
        self.discovery_requests.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read exactly `buf.len()` bytes, tolerating read timeouts. Returns false
/// when the peer closed or the server is stopping.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], stop: &AtomicBool) -> std::io::Result<bool> {
    let mut off = 0;
    while off < buf.len() {
        match stream.read(&mut buf[off..]) {
            Ok(0) => return Ok(false),
            Ok(n) => off += n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if stop.load(Ordering::SeqCst) {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn write_frame(stream: &mut TcpStream, hdr: FrameHeader, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&hdr.to_bytes())?;
    stream.write_all(body)
}

fn serve_conn(
    mut stream: TcpStream,
    stop: &AtomicBool,
    discovery_requests: &AtomicU64,
    url: &str,
    empty_discovery_replies: u64,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(20)))
        .expect("read timeout");
    stream.set_nodelay(true).expect("nodelay");

    let mut session_config = SessionConfig::default();
    let mut total_count: u64 = 0;
    let mut total_size: u64 = 0;

    loop {
        let mut hdr_buf = [0u8; FRAME_HDR_SIZE];
        match read_full(&mut stream, &mut hdr_buf, stop) {
            Ok(true) => {}
            Ok(false) => return,
            Err(_) => return,
        }
        let hdr = FrameHeader::from_bytes(&hdr_buf).expect("valid frame header");
        let mut body = vec![0u8; hdr.len as usize];
        match read_full(&mut stream, &mut body, stop) {
            Ok(true) => {}
            Ok(false) => return,
            Err(_) => return,
        }

        match (hdr.kind, hdr.verb) {
            (FrameKind::Request, wire::GET_DATA_URL) => {
                let seen = discovery_requests.fetch_add(1, Ordering::SeqCst) + 1;
                let reply: &[u8] =
                    if seen <= empty_discovery_replies { &[] } else { url.as_bytes() };
                let resp = FrameHeader::response(wire::GET_DATA_URL, hdr.seq, reply.len());
                if write_frame(&mut stream, resp, reply).is_err() {
                    return;
                }
            }
            (FrameKind::Request, wire::START_SESSION) => {
                session_config = SessionConfig::from_bytes(&body).expect("session config");
                total_count = 0;
                total_size = 0;
                let ack = SessionAck { session_id: TEST_SESSION_ID };
                let resp =
                    FrameHeader::response(wire::START_SESSION, hdr.seq, ack.to_bytes().len());
                if write_frame(&mut stream, resp, &ack.to_bytes()).is_err() {
                    return;
                }
            }
            (FrameKind::Oneway, wire::REQUEST) => {
                let req = RequestHeader::from_bytes(&body).expect("request header");
                assert_eq!(req.session_id, TEST_SESSION_ID);
                total_count += 1;
                total_size += body.len() as u64;
                if total_count % session_config.ack_count as u64 == 0 {
                    let ack = Ack {
                        session_id: TEST_SESSION_ID,
                        total_count,
                        total_size,
                        checksum: wire::expected_checksum(total_count),
                    };
                    let frame = FrameHeader::oneway(wire::ACK, ack.to_bytes().len());
                    if write_frame(&mut stream, frame, &ack.to_bytes()).is_err() {
                        return;
                    }
                }
            }
            (kind, verb) => {
                panic!("test server got unexpected frame kind={kind:?} verb={verb:#06x}");
            }
        }
    }
}
