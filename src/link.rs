// src/link.rs
// UDP link layer: one socket, a receive worker, unicast plus
// broadcast/multicast sends for peer discovery.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::util;

pub const DEFAULT_MASTER_PORT: u16 = 29350;
pub const DEFAULT_SLAVE_PORT: u16 = 29360;

// pairing frames must fit a single datagram
const BUFFER_SIZE: usize = 65535;
const RECV_TIMEOUT_MS: u64 = 500;

pub type MessageCallback = Arc<dyn Fn(&str, SocketAddr) + Send + Sync>;

/// Datagram transport for the pairing protocol. `stop()` is idempotent; all
/// replies should be addressed to the source of the triggering datagram so
/// that peers may bind OS-assigned ports.
pub struct UdpLink {
    port: u16,
    multicast_ip: String,
    socket: Arc<RwLock<Option<UdpSocket>>>,
    running: Arc<RwLock<bool>>,
    callback: Arc<RwLock<Option<MessageCallback>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UdpLink {
    /// `port` 0 asks the OS for a free port. An empty `multicast_ip` selects
    /// plain broadcast.
    pub fn new(port: u16, multicast_ip: &str) -> Self {
        Self {
            port,
            multicast_ip: multicast_ip.to_string(),
            socket: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(false)),
            callback: Arc::new(RwLock::new(None)),
            worker: Mutex::new(None),
        }
    }

    /// Register the receive callback. Must happen before `init`.
    pub fn register_message_callback(&self, callback: MessageCallback) {
        let mut cb = self.callback.write().unwrap();
        *cb = Some(callback);
    }

    pub fn init(&self) -> Result<(), String> {
        {
            let mut running = self.running.write().unwrap();
            if *running {
                return Ok(());
            }
            *running = true;
        }

        let socket = create_socket(self.port).map_err(|e| e.to_string())?;
        socket
            .set_read_timeout(Some(Duration::from_millis(RECV_TIMEOUT_MS)))
            .map_err(|e| e.to_string())?;

        if !self.multicast_ip.is_empty() {
            let group: Ipv4Addr = self.multicast_ip.parse().map_err(|_| "invalid multicast ip")?;
            let sock = SockRef::from(&socket);
            sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                .map_err(|e| e.to_string())?;
        }

        let worker_socket = socket.try_clone().map_err(|e| e.to_string())?;
        {
            let mut sock = self.socket.write().unwrap();
            *sock = Some(socket);
        }

        let running = Arc::clone(&self.running);
        let callback = Arc::clone(&self.callback);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; BUFFER_SIZE];
            while *running.read().unwrap() {
                match worker_socket.recv_from(&mut buf) {
                    Ok((size, src)) => {
                        if let Ok(text) = std::str::from_utf8(&buf[..size]) {
                            let cb = callback.read().unwrap().clone();
                            if let Some(cb) = cb {
                                cb(text, src);
                            }
                        }
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        // read timeout, just re-check the running flag
                    }
                    Err(_) => {
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        });

        let mut worker = self.worker.lock().unwrap();
        *worker = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        {
            let mut running = self.running.write().unwrap();
            if !*running {
                return;
            }
            *running = false;
        }
        {
            let mut sock = self.socket.write().unwrap();
            *sock = None;
        }
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Port the socket ended up bound to.
    pub fn local_port(&self) -> u16 {
        self.socket
            .read()
            .unwrap()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
            .unwrap_or(0)
    }

    pub fn send(&self, msg: &str, ip: &str, port: u16) -> Result<(), String> {
        let addr: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .map_err(|e: std::net::AddrParseError| e.to_string())?;
        self.send_to(msg, addr)
    }

    pub fn send_to(&self, msg: &str, addr: SocketAddr) -> Result<(), String> {
        let socket = self.socket.read().unwrap();
        let socket = socket.as_ref().ok_or("link layer not initialized")?;
        socket.send_to(msg.as_bytes(), addr).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Announce to everyone reachable: the configured multicast group from
    /// every local interface, or the global broadcast address plus every
    /// interface's subnet broadcast.
    pub fn send_broadcast(&self, msg: &str, port: u16) -> Result<(), String> {
        let socket = self.socket.read().unwrap();
        let socket = socket.as_ref().ok_or("link layer not initialized")?;

        if !self.multicast_ip.is_empty() {
            let group: Ipv4Addr = self.multicast_ip.parse().map_err(|_| "invalid multicast ip")?;
            let target = SocketAddr::new(IpAddr::V4(group), port);
            let sock = SockRef::from(socket);
            for local in util::local_ipv4_addresses() {
                if sock.set_multicast_if_v4(&local).is_ok() {
                    let _ = socket.send_to(msg.as_bytes(), target);
                }
            }
            return Ok(());
        }

        let global = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
        let _ = socket.send_to(msg.as_bytes(), global);
        for bcast in util::local_broadcast_addresses() {
            let _ = socket.send_to(msg.as_bytes(), SocketAddr::new(IpAddr::V4(bcast), port));
        }
        Ok(())
    }

    /// Join the configured multicast group on one more interface.
    pub fn add_multicast_membership(&self, interface_ip: &str) -> Result<(), String> {
        if self.multicast_ip.is_empty() {
            return Ok(());
        }
        let group: Ipv4Addr = self.multicast_ip.parse().map_err(|_| "invalid multicast ip")?;
        let iface: Ipv4Addr = interface_ip.parse().map_err(|_| "invalid interface ip")?;
        let socket = self.socket.read().unwrap();
        let socket = socket.as_ref().ok_or("link layer not initialized")?;
        SockRef::from(socket)
            .join_multicast_v4(&group, &iface)
            .map_err(|e| e.to_string())
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn create_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // Allow several managers on the same machine to share discovery ports
    socket.set_reuse_address(true)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;

    socket.set_broadcast(true)?;

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[test]
    fn test_unicast_roundtrip() {
        let a = UdpLink::new(0, "");
        let b = UdpLink::new(0, "");

        let (tx, rx) = unbounded::<(String, SocketAddr)>();
        b.register_message_callback(Arc::new(move |msg, from| {
            let _ = tx.send((msg.to_string(), from));
        }));

        a.init().unwrap();
        b.init().unwrap();

        let b_port = b.local_port();
        assert_ne!(b_port, 0);

        a.send("ping", "127.0.0.1", b_port).unwrap();
        let (msg, _from) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg, "ping");

        a.stop();
        b.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let link = UdpLink::new(0, "");
        link.init().unwrap();
        link.stop();
        link.stop();
        assert!(link.send("x", "127.0.0.1", 9).is_err());
    }

    #[test]
    fn test_broadcast_reaches_local_listener() {
        let listener = UdpLink::new(0, "");
        let (tx, rx) = unbounded::<String>();
        listener.register_message_callback(Arc::new(move |msg, _| {
            let _ = tx.send(msg.to_string());
        }));
        listener.init().unwrap();
        let port = listener.local_port();

        let sender = UdpLink::new(0, "");
        sender.init().unwrap();
        sender.send_broadcast("hello lan", port).unwrap();

        let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg, "hello lan");

        sender.stop();
        listener.stop();
    }
}
