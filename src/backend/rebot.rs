//! The rebot backend: a [`RawDevice`] speaking the framed, 32-bit
//! little-endian word TCP protocol used to reach a register map over
//! the network instead of a local bus.
//!
//! Wire format: the client opens a TCP connection and sends a hello
//! word carrying the protocol version it speaks; the server replies
//! with its negotiated version and a session key word. From then on
//! every command is a 4-word header `(opcode, address, length_or_value,
//! bar)`; a write command's header is followed by `length` payload
//! words. Any send/recv that times out faults the backend, matching
//! "pulling the network cable surfaces a runtime error within the
//! configured timeout, and `isFunctional` stays false until the next
//! successful `open`".
//!
//! While the connection is idle, a background thread sends a periodic
//! heartbeat: a zero-length read at bar 0, address 0. It only fires
//! after [`HEARTBEAT_INTERVAL`] has passed with no real traffic, so an
//! actively-used connection never sends one. A heartbeat failure faults
//! the backend immediately, the same as a failed real read/write, so a
//! dead connection is caught even while nothing else is accessing the
//! device.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::numeric_addressed::RawDevice;
use crate::backend::BackendLifecycle;
use crate::error::{io_runtime, DeviceError, Result};

const PROTOCOL_VERSION: u32 = 1;
const OP_READ: u32 = 0;
const OP_WRITE: u32 = 1;

/// How long the connection must sit idle before the background thread
/// sends a heartbeat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How often the background thread wakes up to check.
const HEARTBEAT_POLL: Duration = Duration::from_secs(5);

/// A framed TCP connection to a rebot server, implementing [`RawDevice`]
/// over the 4-word-header protocol. One [`TcpStream`] is shared behind a
/// lock; the protocol is strictly request/response so there is no
/// benefit to finer-grained locking.
#[derive(Debug)]
pub struct RebotDevice {
    endpoint: String,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    last_activity: Mutex<Instant>,
}

impl RebotDevice {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        RebotDevice {
            endpoint: endpoint.into(),
            timeout,
            stream: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Spawns the background heartbeat thread, tied to `lifecycle` so a
    /// failed heartbeat faults the backend the same way a failed real
    /// transfer does. The thread exits once every strong reference to
    /// this device is dropped.
    pub fn start_heartbeat(self: &Arc<Self>, lifecycle: Arc<BackendLifecycle>) {
        self.start_heartbeat_with_timing(lifecycle, HEARTBEAT_INTERVAL, HEARTBEAT_POLL);
    }

    /// Same as [`Self::start_heartbeat`] but with explicit timing, so
    /// tests don't have to wait out the real intervals.
    fn start_heartbeat_with_timing(self: &Arc<Self>, lifecycle: Arc<BackendLifecycle>, interval: Duration, poll: Duration) {
        let weak: Weak<RebotDevice> = Arc::downgrade(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(poll);
            let Some(device) = weak.upgrade() else {
                return;
            };
            if !lifecycle.is_functional() {
                continue;
            }
            if device.last_activity.lock().elapsed() < interval {
                continue;
            }
            if let Err(e) = device.send_heartbeat() {
                tracing::warn!(error = %e, "rebot heartbeat failed");
                lifecycle.set_exception(e.message());
            }
        });
    }

    /// A zero-length read, just to confirm the connection is still
    /// alive. Touches `last_activity` like any other transfer so a
    /// string of successful heartbeats doesn't pile up back to back.
    fn send_heartbeat(&self) -> Result<()> {
        self.read_block(0, 0, 0).map(|_| ())
    }

    fn mark_active(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = self
            .endpoint
            .to_socket_addrs()
            .map_err(|e| io_runtime(&self.endpoint, e))?
            .next()
            .ok_or_else(|| DeviceError::runtime(&self.endpoint, "no address resolved for endpoint"))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| io_runtime(&self.endpoint, e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| io_runtime(&self.endpoint, e))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| io_runtime(&self.endpoint, e))?;
        stream.set_nodelay(true).map_err(|e| io_runtime(&self.endpoint, e))?;
        Ok(stream)
    }

    fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        write_word(stream, &self.endpoint, PROTOCOL_VERSION)?;
        let negotiated = read_word(stream, &self.endpoint)?;
        if negotiated > PROTOCOL_VERSION {
            return Err(DeviceError::runtime(
                &self.endpoint,
                format!("server requires protocol version {negotiated}, we speak {PROTOCOL_VERSION}"),
            ));
        }
        let _session_key = read_word(stream, &self.endpoint)?;
        Ok(())
    }

    fn with_connection<R>(&self, f: impl FnOnce(&mut TcpStream) -> Result<R>) -> Result<R> {
        let mut guard = self.stream.lock();
        let stream = guard
            .as_mut()
            .ok_or_else(|| DeviceError::runtime(&self.endpoint, "device is not open"))?;
        f(stream)
    }
}

fn write_word(stream: &mut TcpStream, path: &str, word: u32) -> Result<()> {
    stream.write_all(&word.to_le_bytes()).map_err(|e| io_runtime(path, e))
}

fn read_word(stream: &mut TcpStream, path: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).map_err(|e| io_runtime(path, e))?;
    Ok(u32::from_le_bytes(buf))
}

impl RawDevice for RebotDevice {
    fn open(&self) -> Result<()> {
        let mut stream = self.connect()?;
        self.handshake(&mut stream)?;
        *self.stream.lock() = Some(stream);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self.stream.lock() = None;
        Ok(())
    }

    fn read_block(&self, bar: u8, byte_address: u64, byte_size: usize) -> Result<Vec<u8>> {
        if byte_size % 4 != 0 {
            return Err(DeviceError::logic(
                &self.endpoint,
                "rebot transfers must be a whole number of 32-bit words",
            ));
        }
        let n_words = (byte_size / 4) as u32;
        let result = self
            .with_connection(|stream| {
                write_word(stream, &self.endpoint, OP_READ)?;
                write_word(stream, &self.endpoint, byte_address as u32)?;
                write_word(stream, &self.endpoint, n_words)?;
                write_word(stream, &self.endpoint, bar as u32)?;

                let mut bytes = Vec::with_capacity(byte_size);
                for _ in 0..n_words {
                    bytes.extend_from_slice(&read_word(stream, &self.endpoint)?.to_le_bytes());
                }
                Ok(bytes)
            })
            .map_err(|e| self.poison_on_runtime(e));
        if result.is_ok() {
            self.mark_active();
        }
        result
    }

    fn write_block(&self, bar: u8, byte_address: u64, data: &[u8]) -> Result<()> {
        if data.len() % 4 != 0 {
            return Err(DeviceError::logic(
                &self.endpoint,
                "rebot transfers must be a whole number of 32-bit words",
            ));
        }
        let n_words = (data.len() / 4) as u32;
        let result = self
            .with_connection(|stream| {
                write_word(stream, &self.endpoint, OP_WRITE)?;
                write_word(stream, &self.endpoint, byte_address as u32)?;
                write_word(stream, &self.endpoint, n_words)?;
                write_word(stream, &self.endpoint, bar as u32)?;
                for chunk in data.chunks_exact(4) {
                    let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    write_word(stream, &self.endpoint, word)?;
                }
                let ack = read_word(stream, &self.endpoint)?;
                if ack != n_words {
                    return Err(DeviceError::runtime(
                        &self.endpoint,
                        format!("server acknowledged {ack} words, expected {n_words}"),
                    ));
                }
                Ok(())
            })
            .map_err(|e| self.poison_on_runtime(e));
        if result.is_ok() {
            self.mark_active();
        }
        result
    }
}

impl RebotDevice {
    /// Any I/O failure drops the cached connection, so the next call
    /// reconnects instead of reusing a stream that may be half-dead;
    /// the backend's own lifecycle is what actually flips to `faulted`.
    fn poison_on_runtime(&self, error: DeviceError) -> DeviceError {
        if error.is_runtime() {
            *self.stream.lock() = None;
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn spawn_echo_server() -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let client_version = read_word(&mut socket, "/server").unwrap();
            write_word(&mut socket, "/server", client_version).unwrap();
            write_word(&mut socket, "/server", 0xABCD).unwrap();

            loop {
                let opcode = match read_word(&mut socket, "/server") {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let _address = read_word(&mut socket, "/server").unwrap();
                let n_words = read_word(&mut socket, "/server").unwrap();
                let _bar = read_word(&mut socket, "/server").unwrap();
                if opcode == OP_READ {
                    for i in 0..n_words {
                        write_word(&mut socket, "/server", i).unwrap();
                    }
                } else {
                    for _ in 0..n_words {
                        read_word(&mut socket, "/server").unwrap();
                    }
                    write_word(&mut socket, "/server", n_words).unwrap();
                }
            }
        });
        (addr, handle)
    }

    #[test]
    fn handshake_then_read_round_trip() {
        let (addr, _handle) = spawn_echo_server();
        let device = RebotDevice::new(addr, Duration::from_secs(1));
        device.open().unwrap();

        let bytes = device.read_block(0, 0, 8).unwrap();
        assert_eq!(bytes, [0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn write_then_ack() {
        let (addr, _handle) = spawn_echo_server();
        let device = RebotDevice::new(addr, Duration::from_secs(1));
        device.open().unwrap();

        device.write_block(0, 0, &[1, 2, 3, 4]).unwrap();
    }

    #[test]
    fn connect_to_closed_port_is_runtime_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let device = RebotDevice::new(addr.to_string(), Duration::from_millis(200));
        let err = device.open().unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn read_before_open_is_runtime_error() {
        let device = RebotDevice::new("127.0.0.1:1", Duration::from_millis(200));
        let err = device.read_block(0, 0, 4).unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn heartbeat_fires_after_idle_and_stays_quiet_during_traffic() {
        let (addr, _handle) = spawn_echo_server();
        let device = Arc::new(RebotDevice::new(addr, Duration::from_secs(1)));
        device.open().unwrap();
        let lifecycle = Arc::new(BackendLifecycle::new());
        lifecycle.mark_open();

        device.start_heartbeat_with_timing(lifecycle.clone(), Duration::from_millis(50), Duration::from_millis(10));

        for _ in 0..5 {
            thread::sleep(Duration::from_millis(20));
            device.read_block(0, 0, 4).unwrap();
        }
        assert!(lifecycle.is_functional());

        thread::sleep(Duration::from_millis(150));
        assert!(lifecycle.is_functional());
    }

    #[test]
    fn heartbeat_failure_faults_the_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let client_version = read_word(&mut socket, "/server").unwrap();
            write_word(&mut socket, "/server", client_version).unwrap();
            write_word(&mut socket, "/server", 0xABCD).unwrap();
            // Accept one command header, then hang up without replying so
            // the heartbeat read times out.
            let _ = read_word(&mut socket, "/server");
            drop(socket);
        });

        let device = Arc::new(RebotDevice::new(addr, Duration::from_millis(100)));
        device.open().unwrap();
        let lifecycle = Arc::new(BackendLifecycle::new());
        lifecycle.mark_open();

        device.start_heartbeat_with_timing(lifecycle.clone(), Duration::from_millis(10), Duration::from_millis(10));

        thread::sleep(Duration::from_millis(500));
        assert!(!lifecycle.is_functional());
        let _ = handle.join();
    }
}
