use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::DeviceError;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Bounded retry for transient bind and connect failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 50,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms.max(1)),
            max_interval: Duration::from_millis(self.initial_backoff_ms.max(1) * 8),
            randomization_factor: 0.2,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Run `op` until it succeeds or `attempts` tries have failed.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 0;
        backoff::retry(self.backoff(), || {
            attempt += 1;
            op().map_err(|e| {
                if attempt >= self.attempts.max(1) {
                    backoff::Error::permanent(e)
                } else {
                    log::debug!("{} failed (attempt {}): {}", what, attempt, e);
                    backoff::Error::transient(e)
                }
            })
        })
        .map_err(|e| match e {
            backoff::Error::Permanent(err) | backoff::Error::Transient { err, .. } => err,
        })
    }
}

/// Where and how a device publishes and listens.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub send_host: Ipv4Addr,
    pub pipe_dir: PathBuf,
    pub pipe_name: String,
    pub pipe_timeout: Duration,
    pub receive_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            send_host: Ipv4Addr::LOCALHOST,
            pipe_dir: std::env::temp_dir(),
            pipe_name: "VRTPipe".to_string(),
            pipe_timeout: Duration::from_millis(2000),
            receive_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

impl LinkSettings {
    /// Pipe endpoint of the device with `code`, e.g. `VRTPipe.DeviceSimulator`.
    pub fn pipe_endpoint(&self, code: &str) -> String {
        format!("{}.{}", self.pipe_name, code)
    }
}

/// Sockets and pipe owned by a single device.
///
/// Receive sockets are bound on `0.0.0.0:port` with address reuse. Send sockets
/// are bound to an ephemeral port and connected to the consumer. Both kinds are
/// keyed by port and created at most once.
#[derive(Debug)]
pub struct Transport {
    receivers: HashMap<u16, UdpSocket>,
    senders: HashMap<u16, UdpSocket>,
    pipe: Option<PipeServer>,
    receive_timeout: Duration,
    buffer: Vec<u8>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl Transport {
    pub fn new(receive_timeout: Duration) -> Self {
        Self {
            receivers: HashMap::new(),
            senders: HashMap::new(),
            pipe: None,
            receive_timeout,
            buffer: vec![0u8; MAX_DATAGRAM],
        }
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
        for socket in self.receivers.values() {
            let _ = socket.set_read_timeout(Some(timeout));
        }
    }

    pub fn has_receiver(&self, port: u16) -> bool {
        self.receivers.contains_key(&port)
    }

    pub fn has_sender(&self, port: u16) -> bool {
        self.senders.contains_key(&port)
    }

    /// Local address of the receive socket on `port`.
    pub fn receiver_addr(&self, port: u16) -> Option<SocketAddr> {
        self.receivers.get(&port).and_then(|s| s.local_addr().ok())
    }

    pub fn create_receive_socket(&mut self, port: u16, retry: &RetryPolicy) -> Result<(), DeviceError> {
        if self.receivers.contains_key(&port) {
            return Ok(());
        }

        let socket = retry
            .run("UDP bind", || bind_reusable(port))
            .and_then(|socket| {
                socket.set_read_timeout(Some(self.receive_timeout))?;
                Ok(socket)
            })
            .map_err(|source| DeviceError::SocketNotConnected { port, source })?;

        log::info!("Listening for samples on UDP port {}", port);
        self.receivers.insert(port, socket);
        Ok(())
    }

    pub fn create_send_socket(
        &mut self,
        host: Ipv4Addr,
        port: u16,
        retry: &RetryPolicy,
    ) -> Result<(), DeviceError> {
        if self.senders.contains_key(&port) {
            return Ok(());
        }

        let target = SocketAddrV4::new(host, port);
        let socket = retry
            .run("UDP connect", || {
                let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
                socket.connect(target)?;
                Ok(socket)
            })
            .map_err(|source| DeviceError::SocketNotConnected { port, source })?;

        log::info!("Sending observations to udp://{}", target);
        self.senders.insert(port, socket);
        Ok(())
    }

    /// Wait up to the receive timeout for one datagram on `port`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub fn receive(&mut self, port: u16) -> io::Result<Option<String>> {
        let socket = self
            .receivers
            .get(&port)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no receive socket"))?;

        match socket.recv_from(&mut self.buffer) {
            Ok((len, _addr)) => Ok(Some(String::from_utf8_lossy(&self.buffer[..len]).into_owned())),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send `message` as a single datagram to the consumer on `port`.
    pub fn send_datagram(&self, port: u16, message: &str) -> Result<(), DeviceError> {
        let socket = self.senders.get(&port).ok_or_else(|| DeviceError::SocketNotConnected {
            port,
            source: io::Error::new(io::ErrorKind::NotConnected, "no send socket"),
        })?;
        socket
            .send(message.as_bytes())
            .map(|_| ())
            .map_err(|source| DeviceError::SocketNotConnected { port, source })
    }

    /// Create the named pipe once and wait up to `timeout` for the consumer.
    pub fn create_pipe(
        &mut self,
        dir: &Path,
        name: &str,
        timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<(), DeviceError> {
        if self.pipe.as_ref().is_some_and(|p| p.name != name) {
            self.pipe = None;
        }
        if self.pipe.is_none() {
            self.pipe = Some(PipeServer::create(dir, name, retry)?);
        }
        match self.pipe.as_mut() {
            Some(pipe) => pipe.wait_for_connection(timeout),
            None => Err(DeviceError::PipeNotConnected {
                name: name.to_string(),
            }),
        }
    }

    pub fn pipe_connected(&self) -> bool {
        self.pipe.as_ref().is_some_and(PipeServer::is_connected)
    }

    pub fn pipe_path(&self) -> Option<&Path> {
        self.pipe.as_ref().map(|p| p.path.as_path())
    }

    /// Write `message` as one line to the connected pipe client.
    pub fn write_pipe(&mut self, message: &str) -> Result<(), DeviceError> {
        match self.pipe.as_mut() {
            Some(pipe) => pipe.write_line(message),
            None => Err(DeviceError::PipeNotConnected {
                name: String::new(),
            }),
        }
    }

    pub fn close(&mut self) {
        self.receivers.clear();
        self.senders.clear();
        self.pipe = None;
    }
}

fn bind_reusable(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Local stream endpoint a single consumer connects to.
#[derive(Debug)]
struct PipeServer {
    name: String,
    path: PathBuf,
    /// Device and inode of the socket file this server bound.
    #[cfg(unix)]
    identity: (u64, u64),
    #[cfg(unix)]
    listener: std::os::unix::net::UnixListener,
    #[cfg(unix)]
    client: Option<std::os::unix::net::UnixStream>,
}

#[cfg(unix)]
impl PipeServer {
    const ACCEPT_POLL: Duration = Duration::from_millis(10);
    const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

    fn create(dir: &Path, name: &str, retry: &RetryPolicy) -> Result<Self, DeviceError> {
        use std::os::unix::net::UnixListener;

        let path = dir.join(name);
        let listener = retry
            .run("pipe create", || {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = UnixListener::bind(&path)?;
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .map_err(|e| {
                log::warn!("Cannot create pipe {}: {}", path.display(), e);
                DeviceError::PipeNotConnected {
                    name: name.to_string(),
                }
            })?;

        let identity = Self::identity(&path).ok_or_else(|| DeviceError::PipeNotConnected {
            name: name.to_string(),
        })?;

        log::info!("Pipe {} created at {}", name, path.display());
        Ok(Self {
            name: name.to_string(),
            path,
            identity,
            listener,
            client: None,
        })
    }

    fn identity(path: &Path) -> Option<(u64, u64)> {
        use std::os::unix::fs::MetadataExt;

        std::fs::symlink_metadata(path)
            .ok()
            .map(|meta| (meta.dev(), meta.ino()))
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Accept on a worker so a missing consumer only costs `timeout`.
    fn wait_for_connection(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        if self.client.is_some() {
            return Ok(());
        }

        let not_connected = || DeviceError::PipeNotConnected {
            name: self.name.clone(),
        };
        let listener = self.listener.try_clone().map_err(|_| not_connected())?;
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + timeout;
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = tx.send(Some(stream));
                        return;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if std::time::Instant::now() >= deadline {
                            let _ = tx.send(None);
                            return;
                        }
                        std::thread::sleep(Self::ACCEPT_POLL);
                    }
                    Err(e) => {
                        log::warn!("Pipe accept failed: {}", e);
                        let _ = tx.send(None);
                        return;
                    }
                }
            }
        });

        let stream = rx
            .recv_timeout(timeout + Self::ACCEPT_POLL * 10)
            .ok()
            .flatten()
            .ok_or_else(not_connected)?;
        stream.set_nonblocking(false).map_err(|_| not_connected())?;
        stream
            .set_write_timeout(Some(Self::WRITE_TIMEOUT))
            .map_err(|_| not_connected())?;

        log::info!("Consumer connected to pipe {}", self.name);
        self.client = Some(stream);
        Ok(())
    }

    fn write_line(&mut self, message: &str) -> Result<(), DeviceError> {
        let client = self.client.as_mut().ok_or_else(|| DeviceError::PipeNotConnected {
            name: self.name.clone(),
        })?;

        let written = writeln!(client, "{message}").and_then(|()| client.flush());
        if let Err(e) = written {
            log::warn!("Pipe {} disconnected: {}", self.name, e);
            self.client = None;
            return Err(DeviceError::PipeNotConnected {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for PipeServer {
    /// Unlink the socket file unless another server has replaced it.
    fn drop(&mut self) {
        if Self::identity(&self.path) == Some(self.identity) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(not(unix))]
impl PipeServer {
    fn create(_dir: &Path, name: &str, _retry: &RetryPolicy) -> Result<Self, DeviceError> {
        Err(DeviceError::PipeNotConnected {
            name: name.to_string(),
        })
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn wait_for_connection(&mut self, _timeout: Duration) -> Result<(), DeviceError> {
        Err(DeviceError::PipeNotConnected {
            name: self.name.clone(),
        })
    }

    fn write_line(&mut self, _message: &str) -> Result<(), DeviceError> {
        Err(DeviceError::PipeNotConnected {
            name: self.name.clone(),
        })
    }
}
