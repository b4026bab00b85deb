//! Background pumping of a [`Transport`] while the host is not ticking.
//!
//! Some hosts block their main loop for a long time (loading a stage, a modal dialog).
//! Connection-oriented transports still need to be serviced meanwhile, or the peer sees
//! a timeout. [`KeepAlive`] wraps a transport, and while [`start`](KeepAlive::start)ed
//! a background thread polls it and buffers the events for the next regular
//! [`poll`](Transport::poll).
//!
//! The session owns its transport, so start the keep-alive before handing it over. It then
//! runs for the whole session and stops when the session drops it. Events it collects
//! while the host is ticking normally come out of the next `poll` in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use web_time::Duration;

use crate::network::control::IpAddrPort;
use crate::network::messages::NetplayMessage;
use crate::{Channel, NetplayError, Transport, TransportEvent};

/// Default pause between background polls.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(5);

struct Shared<A> {
    transport: Box<dyn Transport<A> + Send>,
    buffered: Vec<TransportEvent<A>>,
}

/// A [`Transport`] that can be kept alive from a background thread.
pub struct KeepAlive<A> {
    shared: Arc<Mutex<Shared<A>>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    interval: Duration,
}

impl<A: Send + 'static> KeepAlive<A> {
    /// Wraps `transport`. Nothing runs in the background until [`start`](Self::start).
    pub fn new(transport: impl Transport<A> + Send + 'static) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                transport: Box::new(transport),
                buffered: Vec::new(),
            })),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }

    /// Sets the pause between background polls.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// `true` while the background thread runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Events collected by the background thread and not yet returned by `poll`.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.lock().buffered.len()
    }

    /// Starts polling in the background. Does nothing if already running.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::SocketError`] if the thread cannot be spawned.
    pub fn start(&mut self) -> Result<(), NetplayError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let worker = std::thread::Builder::new()
            .name("netplay-keep-alive".to_owned())
            .spawn(move || {
                tracing::debug!("keep-alive started");
                while running.load(Ordering::Acquire) {
                    {
                        let mut shared = shared.lock();
                        let events = shared.transport.poll(Duration::ZERO);
                        shared.buffered.extend(events);
                    }
                    std::thread::sleep(interval);
                }
                tracing::debug!("keep-alive stopped");
            })
            .map_err(|err| NetplayError::SocketError {
                context: format!("failed to spawn keep-alive thread: {err}"),
            })?;
        self.worker = Some(worker);
        Ok(())
    }
}

impl<A> KeepAlive<A> {
    /// Stops the background thread and waits for it to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("keep-alive thread panicked");
            }
        }
    }
}

impl<A> Drop for KeepAlive<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<A> std::fmt::Debug for KeepAlive<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("running", &self.worker.is_some())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl<A: Send + 'static> Transport<A> for KeepAlive<A> {
    fn listen(&mut self, channel: Channel, port: u16) -> Result<u16, NetplayError> {
        self.shared.lock().transport.listen(channel, port)
    }

    fn connect(&mut self, channel: Channel, target: &IpAddrPort) -> Result<A, NetplayError> {
        self.shared.lock().transport.connect(channel, target)
    }

    fn send(&mut self, channel: Channel, to: &A, msg: &NetplayMessage) -> Result<(), NetplayError> {
        self.shared.lock().transport.send(channel, to, msg)
    }

    fn disconnect(&mut self, channel: Channel, peer: &A) {
        self.shared.lock().transport.disconnect(channel, peer);
    }

    fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent<A>> {
        let mut shared = self.shared.lock();
        let mut events = std::mem::take(&mut shared.buffered);
        let wait = if events.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        events.extend(shared.transport.poll(wait));
        events
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::loopback::LoopbackHub;

    #[test]
    fn background_events_are_returned_in_order() {
        let hub = LoopbackHub::new();
        let mut host = KeepAlive::new(hub.endpoint()).with_interval(Duration::from_millis(1));
        let mut client = hub.endpoint();
        let port = host.listen(Channel::Data, 0).unwrap();

        host.start().unwrap();
        let to_host = client
            .connect(Channel::Data, &IpAddrPort::new("127.0.0.1", port))
            .unwrap();
        client
            .send(Channel::Data, &to_host, &NetplayMessage::ConfirmConfig)
            .unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while host.buffered() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        host.stop();
        assert!(!host.is_running());

        let events = host.poll(Duration::ZERO);
        assert!(matches!(events[0], TransportEvent::Accepted { .. }));
        assert!(matches!(events[1], TransportEvent::Received { .. }));
        assert_eq!(host.buffered(), 0);
    }

    #[test]
    fn poll_without_background_thread_passes_through() {
        let hub = LoopbackHub::new();
        let mut host = KeepAlive::new(hub.endpoint());
        let mut client = hub.endpoint();
        let port = host.listen(Channel::Control, 0).unwrap();
        client
            .connect(Channel::Control, &IpAddrPort::new("127.0.0.1", port))
            .unwrap();
        assert_eq!(host.poll(Duration::ZERO).len(), 1);
    }

    #[test]
    fn start_twice_is_harmless() {
        let hub = LoopbackHub::new();
        let mut transport = KeepAlive::new(hub.endpoint());
        transport.start().unwrap();
        transport.start().unwrap();
        assert!(transport.is_running());
        transport.stop();
        transport.stop();
    }

    #[test]
    fn dropping_a_running_keep_alive_joins_the_worker() {
        let hub = LoopbackHub::new();
        let mut transport = KeepAlive::new(hub.endpoint()).with_interval(Duration::from_millis(1));
        transport.start().unwrap();
        let running = Arc::clone(&transport.running);
        let shared = Arc::clone(&transport.shared);
        drop(transport);
        assert!(!running.load(Ordering::Acquire));
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
