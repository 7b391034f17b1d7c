//! In-memory handoff between two participants sharing one address space.
//!
//! Both sides obtain their transport from the same [`InProcessExchange`] handle; the exchange
//! holds one unbounded channel per `(connection, identifier)` pair. Received payloads are owned by
//! the receiver; the sender keeps its own copy.
//!
//! A session admits two participants. Once it is full or ended, the next `open` of the same
//! connection starts a fresh session, so payloads nobody consumed are dropped with the old one.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{data::Payload, error::TransportError, settings::Settings, transport::Transport};

/// Shared rendezvous point of in-process connections.
///
/// Clone the handle and hand one copy to each participant.
#[derive(Debug, Clone, Default)]
pub struct InProcessExchange {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

#[derive(Debug, Default)]
struct Session {
    channels: Mutex<HashMap<String, (Sender<Payload>, Receiver<Payload>)>>,
    ended: AtomicBool,
    /// Only changed while the exchange lock is held.
    members: AtomicUsize,
}

impl Session {
    fn channel(&self, identifier: &str) -> (Sender<Payload>, Receiver<Payload>) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(identifier.to_owned())
            .or_insert_with(crossbeam_channel::unbounded)
            .clone()
    }
}

impl InProcessExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the session of `connection` that still waits for a participant, or start a new one.
    pub fn open(&self, connection: &str, settings: &Settings) -> InProcessTransport {
        let session = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let joinable = sessions
                .get(connection)
                .filter(|s| {
                    s.members.load(Ordering::SeqCst) < 2 && !s.ended.load(Ordering::SeqCst)
                })
                .cloned();
            let session = joinable.unwrap_or_else(|| {
                log::debug!("Connection \"{connection}\" starts a new in-process session");
                let session = Arc::new(Session::default());
                sessions.insert(connection.to_owned(), session.clone());
                session
            });
            session.members.fetch_add(1, Ordering::SeqCst);
            session
        };

        InProcessTransport {
            connection: connection.to_owned(),
            session,
            poll_interval: settings.poll_interval,
            timeout: settings.timeout,
        }
    }
}

#[derive(Debug)]
pub struct InProcessTransport {
    connection: String,
    session: Arc<Session>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl Transport for InProcessTransport {
    fn send(&mut self, identifier: &str, payload: &Payload) -> Result<(), TransportError> {
        let (tx, _) = self.session.channel(identifier);
        // the session holds a receiver, so the channel cannot be disconnected
        let _ = tx.send(payload.clone());
        log::trace!("Queued {:?} for \"{identifier}\"", payload.kind());
        Ok(())
    }

    fn receive(&mut self, identifier: &str) -> Result<Payload, TransportError> {
        let (_, rx) = self.session.channel(identifier);
        let start = Instant::now();
        loop {
            match rx.recv_timeout(self.poll_interval) {
                Ok(payload) => return Ok(payload),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
            if self.session.ended.load(Ordering::SeqCst) && rx.is_empty() {
                return Err(TransportError::SessionEnded {
                    connection: self.connection.clone(),
                    identifier: identifier.to_owned(),
                });
            }
            let waited = start.elapsed();
            if self.timeout.is_some_and(|timeout| waited >= timeout) {
                return Err(TransportError::Timeout {
                    connection: self.connection.clone(),
                    identifier: identifier.to_owned(),
                    waited,
                });
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.session.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}
