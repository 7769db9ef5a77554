//! Shared-port TCP listener. A Server always reserves the port for incoming
//! connections; whether it actually accepts them is controlled by the
//! `listen` flag (§4.3), since some deployments want hole-punch-only
//! behavior with no public listening socket.

use std::io;
use std::net::TcpStream;

use socket2::Socket;

use crate::endpoint::Family;
use crate::sockopt;

const BACKLOG: i32 = 128;

/// Non-blocking TCP accept socket on the Server's shared port.
pub struct Listener {
    socket: Option<Socket>,
    listening: bool,
}

impl Listener {
    /// Bind the shared port. If `listen` is `false` the socket is bound
    /// (still reserving the port, still usable by `HolePuncher` dial
    /// sockets that share it) but `listen()` is never called on it, so
    /// `take_new_connections` always returns empty.
    pub fn new(family: Family, port: u16, listen: bool) -> io::Result<Self> {
        let socket = sockopt::bind_stream_socket(family, port)?;
        if listen {
            socket.listen(BACKLOG)?;
        }
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Some(socket),
            listening: listen,
        })
    }

    /// Drain every connection the kernel has already accepted for us,
    /// non-blocking. Called once per tick; an empty result means there is
    /// nothing new, not an error.
    pub fn take_new_connections(&self) -> Vec<TcpStream> {
        let Some(socket) = &self.socket else {
            return Vec::new();
        };
        if !self.listening {
            return Vec::new();
        }

        let mut accepted = Vec::new();
        loop {
            match socket.accept() {
                Ok((stream, _addr)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        tracing::debug!("could not set accepted socket non-blocking: {err}");
                        continue;
                    }
                    accepted.push(stream.into());
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::debug!("accept failed: {err}");
                    break;
                }
            }
        }
        accepted
    }

    pub fn close(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn accepts_connection_when_listening() {
        let listener = Listener::new(Family::V4, 0, true).unwrap();
        let local_port = listener.socket.as_ref().unwrap().local_addr().unwrap().as_socket().unwrap().port();

        let _client = StdTcpStream::connect(("127.0.0.1", local_port)).unwrap();

        let mut accepted = Vec::new();
        for _ in 0..200 {
            accepted = listener.take_new_connections();
            if !accepted.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn never_accepts_when_not_listening() {
        let listener = Listener::new(Family::V4, 0, false).unwrap();
        assert!(listener.take_new_connections().is_empty());
    }

    #[test]
    fn closed_listener_returns_no_connections() {
        let mut listener = Listener::new(Family::V4, 0, true).unwrap();
        listener.close();
        assert!(listener.take_new_connections().is_empty());
    }
}
