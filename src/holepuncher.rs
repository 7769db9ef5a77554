//! TCP simultaneous-open hole punching: one dedicated worker thread per
//! in-flight dial attempt, each binding the Server's shared local port and
//! blocking on `connect` to a remote endpoint (§4.5).
//!
//! Cancellation does not kill the worker thread. `remove_hole_puncher`
//! shuts down a duplicated descriptor of the attempt's socket, which — since
//! `try_clone` shares the same underlying open file description — unblocks
//! the worker's in-progress `connect` from the other side. The attempt table
//! is the single source of truth for "is this attempt still live": a worker
//! that finishes (successfully or not) after its entry has already been
//! removed drops its result on the floor instead of reporting it.

use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use socket2::Socket;

use crate::endpoint::Family;
use crate::sockopt;
use crate::Endpoint;

/// Default per-attempt connect timeout (§4.5), used when a caller does not
/// supply its own via [`HolePuncher::hole_punch`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks in-flight and completed TCP hole-punch attempts for one Server.
pub struct HolePuncher {
    family: Family,
    port: u16,
    attempts: Arc<Mutex<HashMap<Endpoint, Socket>>>,
    successes: Arc<Mutex<Vec<(Endpoint, TcpStream)>>>,
    fails: Arc<Mutex<HashSet<Endpoint>>>,
}

impl HolePuncher {
    pub fn new(family: Family, port: u16) -> Self {
        Self {
            family,
            port,
            attempts: Arc::new(Mutex::new(HashMap::new())),
            successes: Arc::new(Mutex::new(Vec::new())),
            fails: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start dialing `endpoint` in a new thread, blocking on `connect` for up
    /// to `timeout`. A no-op if an attempt for this endpoint is already in
    /// flight — callers that want to retry must `remove_hole_puncher` first.
    /// Removes `endpoint` from the fails set, so a fresh attempt after a
    /// prior failure does not leave a stale fail queued for the next drain.
    pub fn hole_punch(&self, endpoint: Endpoint, timeout: Duration) {
        let mut table = self.attempts.lock().unwrap();
        if table.contains_key(&endpoint) {
            return;
        }

        let socket = match sockopt::bind_stream_socket(self.family, self.port) {
            Ok(socket) => socket,
            Err(err) => {
                tracing::warn!("could not open hole-punch socket for {endpoint}: {err}");
                return;
            }
        };
        let cancel_handle = match socket.try_clone() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!("could not duplicate hole-punch socket for {endpoint}: {err}");
                return;
            }
        };
        table.insert(endpoint, cancel_handle);
        drop(table);
        self.fails.lock().unwrap().remove(&endpoint);

        spawn_attempt(
            endpoint,
            socket,
            timeout,
            Arc::clone(&self.attempts),
            Arc::clone(&self.successes),
            Arc::clone(&self.fails),
        );
    }

    /// Cancel an in-flight attempt, if any. Its worker thread's eventual
    /// connect failure is dropped silently — no fail is recorded for a
    /// cancelled attempt.
    pub fn remove_hole_puncher(&self, endpoint: &Endpoint) {
        let mut table = self.attempts.lock().unwrap();
        if let Some(cancel_handle) = table.remove(endpoint) {
            if let Err(err) = cancel_handle.shutdown(Shutdown::Both) {
                tracing::debug!("shutdown of cancelled hole-punch socket for {endpoint}: {err}");
            }
        }
    }

    /// Drain every attempt that has connected since the last call.
    pub fn take_successes(&self) -> Vec<(Endpoint, TcpStream)> {
        std::mem::take(&mut *self.successes.lock().unwrap())
    }

    /// Drain every attempt that has failed (timed out or been refused)
    /// since the last call.
    pub fn take_fails(&self) -> Vec<Endpoint> {
        self.fails.lock().unwrap().drain().collect()
    }

    /// Cancel every in-flight attempt and discard any buffered results.
    pub fn close(&self) {
        let endpoints: Vec<Endpoint> = self.attempts.lock().unwrap().keys().copied().collect();
        for endpoint in endpoints {
            self.remove_hole_puncher(&endpoint);
        }
        self.successes.lock().unwrap().clear();
        self.fails.lock().unwrap().clear();
    }
}

fn spawn_attempt(
    endpoint: Endpoint,
    socket: Socket,
    timeout: Duration,
    attempts: Arc<Mutex<HashMap<Endpoint, Socket>>>,
    successes: Arc<Mutex<Vec<(Endpoint, TcpStream)>>>,
    fails: Arc<Mutex<HashSet<Endpoint>>>,
) {
    thread::spawn(move || {
        let result = socket.connect_timeout(&endpoint.to_socket_addr().into(), timeout);

        // If the entry is gone, `remove_hole_puncher` already cancelled
        // this attempt; whatever `connect` returned is stale.
        if attempts.lock().unwrap().remove(&endpoint).is_none() {
            return;
        }

        match result {
            Ok(()) => {
                if let Err(err) = socket.set_nonblocking(true) {
                    tracing::debug!(
                        "hole-punch socket to {endpoint} could not be set non-blocking: {err}"
                    );
                }
                successes.lock().unwrap().push((endpoint, socket.into()));
            }
            Err(err) => {
                tracing::debug!("hole punch to {endpoint} failed: {err}");
                fails.lock().unwrap().insert(endpoint);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread::sleep;
    use std::time::Duration as StdDuration;

    fn unroutable_endpoint() -> Endpoint {
        // TEST-NET-1, not expected to answer or refuse quickly — used only
        // to exercise cancellation before any connect outcome arrives.
        Endpoint::V4 {
            addr: Ipv4Addr::new(192, 0, 2, 55),
            port: 9,
        }
    }

    #[test]
    fn duplicate_hole_punch_is_ignored() {
        let puncher = HolePuncher::new(Family::V4, 0);
        let target = unroutable_endpoint();
        puncher.hole_punch(target, DEFAULT_CONNECT_TIMEOUT);
        let first_len = puncher.attempts.lock().unwrap().len();
        puncher.hole_punch(target, DEFAULT_CONNECT_TIMEOUT);
        let second_len = puncher.attempts.lock().unwrap().len();
        assert_eq!(first_len, 1);
        assert_eq!(second_len, 1);
        puncher.close();
    }

    #[test]
    fn cancelled_attempt_never_reports_a_fail() {
        let puncher = HolePuncher::new(Family::V4, 0);
        let target = unroutable_endpoint();
        puncher.hole_punch(target, DEFAULT_CONNECT_TIMEOUT);
        puncher.remove_hole_puncher(&target);

        sleep(StdDuration::from_millis(200));
        assert!(puncher.take_fails().is_empty());
        assert!(puncher.take_successes().is_empty());
    }

    #[test]
    fn successful_simultaneous_open_reports_success_on_both_sides() {
        let a_port = {
            let probe = sockopt::bind_stream_socket(Family::V4, 0).unwrap();
            probe.local_addr().unwrap().as_socket().unwrap().port()
        };
        let b_port = {
            let probe = sockopt::bind_stream_socket(Family::V4, 0).unwrap();
            probe.local_addr().unwrap().as_socket().unwrap().port()
        };

        let a = HolePuncher::new(Family::V4, a_port);
        let b = HolePuncher::new(Family::V4, b_port);

        let a_endpoint = Endpoint::V4 {
            addr: Ipv4Addr::new(127, 0, 0, 1),
            port: b_port,
        };
        let b_endpoint = Endpoint::V4 {
            addr: Ipv4Addr::new(127, 0, 0, 1),
            port: a_port,
        };

        a.hole_punch(a_endpoint, DEFAULT_CONNECT_TIMEOUT);
        b.hole_punch(b_endpoint, DEFAULT_CONNECT_TIMEOUT);

        let mut a_ok = false;
        let mut b_ok = false;
        for _ in 0..200 {
            if !a_ok && !a.take_successes().is_empty() {
                a_ok = true;
            }
            if !b_ok && !b.take_successes().is_empty() {
                b_ok = true;
            }
            if a_ok && b_ok {
                break;
            }
            sleep(StdDuration::from_millis(20));
        }
        assert!(a_ok && b_ok);
        a.close();
        b.close();
    }
}
