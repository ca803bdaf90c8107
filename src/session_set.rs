use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::clock::{time_diff, Clock};
use crate::config::DEFAULT_INTERVAL_MILLIS;
use crate::engine::kcp::KcpEngine;
use crate::engine::{conv_of_frame, ArqEngine, EngineError};
use crate::session::Session;

/// Several sessions sharing one datagram transport, e.g. a single UDP socket.
///
/// Inbound frames are routed to their session by conversation id, and [SessionSet::update_due]
///  updates exactly those sessions whose `when_to_update` time has come.
pub struct SessionSet<E: ArqEngine = KcpEngine> {
    sessions: FxHashMap<u32, Session<E>>,
}

impl<E: ArqEngine> Default for SessionSet<E> {
    fn default() -> Self {
        SessionSet {
            sessions: FxHashMap::default(),
        }
    }
}

impl<E: ArqEngine> SessionSet<E> {
    pub fn new() -> SessionSet<E> {
        Self::default()
    }

    /// Fails if there is already a session with the same conversation id
    pub fn insert(&mut self, session: Session<E>) -> anyhow::Result<()> {
        let conv = session.conversation_id();
        if self.sessions.contains_key(&conv) {
            bail!("there is already a session for conversation {}", conv);
        }

        debug!("adding session for conversation {}", conv);
        self.sessions.insert(conv, session);
        Ok(())
    }

    pub fn remove(&mut self, conv: u32) -> Option<Session<E>> {
        self.sessions.remove(&conv)
    }

    pub fn get(&self, conv: u32) -> Option<&Session<E>> {
        self.sessions.get(&conv)
    }

    pub fn get_mut(&mut self, conv: u32) -> Option<&mut Session<E>> {
        self.sessions.get_mut(&conv)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.sessions.keys().copied()
    }

    /// Hands a raw frame to the session it belongs to, returning that session's conversation id
    pub fn input(&mut self, frame: &[u8]) -> anyhow::Result<u32> {
        let conv = conv_of_frame(frame)
            .ok_or(EngineError::FrameTooShort)?;
        let session = self.sessions.get_mut(&conv)
            .ok_or_else(|| anyhow!("received frame for unknown conversation {}", conv))?;

        session.input(frame)?;
        Ok(conv)
    }

    /// Updates all sessions that are due at `now_millis`, returning the earliest time at which
    ///  the next update is due.
    ///
    /// A session that cannot be updated does not keep the others from being updated. The first
    ///  such failure is returned after all due sessions were processed.
    pub fn update_due(&mut self, now_millis: u32) -> anyhow::Result<u32> {
        let mut next_due: Option<u32> = None;
        let mut first_error: Option<anyhow::Error> = None;

        for (conv, session) in self.sessions.iter_mut() {
            let mut due = session.when_to_update(now_millis);
            if time_diff(due, now_millis) <= 0 {
                trace!("updating session {}", conv);
                if let Err(e) = session.update(now_millis) {
                    debug!("failed to update session {}: {}", conv, e);
                    first_error.get_or_insert(e);
                }
                due = session.when_to_update(now_millis);
            }

            next_due = match next_due {
                Some(prev) if time_diff(prev, due) <= 0 => Some(prev),
                _ => Some(due),
            };
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(next_due.unwrap_or(now_millis.wrapping_add(DEFAULT_INTERVAL_MILLIS))),
        }
    }

    pub fn poll(&mut self, clock: &dyn Clock) -> anyhow::Result<u32> {
        self.update_due(clock.now_millis())
    }
}
