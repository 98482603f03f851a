use super::Conversation;
use crate::Error;
use crate::event::MessageEvent;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum RetransmitMode {
    #[default]
    None,
    /// Messages held back while encryption was required.
    Exact,
    /// The last message, after the peer reported an error.
    WithPrefix,
}

/// Most messages held back at once. The oldest is dropped to make room.
const MAX_QUEUED: usize = 100;

struct Pending {
    message: Vec<u8>,
    at: Instant,
}

impl Pending {
    fn new(message: &[u8]) -> Self {
        Self {
            message: message.to_vec(),
            at: Instant::now(),
        }
    }

    fn is_fresh(&self, max_age: Duration) -> bool {
        self.at.elapsed() <= max_age
    }
}

#[derive(Default)]
struct ResendState {
    mode: RetransmitMode,
    messages: VecDeque<Pending>,
}

/// Messages that may have to be sent again.
#[derive(Default)]
pub(super) struct ResendQueue {
    state: Mutex<ResendState>,
}

impl ResendQueue {
    fn lock(&self) -> MutexGuard<'_, ResendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Holds a message back until the conversation is private.
    ///
    /// Messages older than `max_age` are dropped first, then the oldest ones
    /// while more than `MAX_QUEUED` are waiting.
    pub(super) fn queue(&self, message: &[u8], max_age: Duration) {
        let mut state = self.lock();
        if state.mode != RetransmitMode::Exact {
            state.messages.clear();
        }
        state.mode = RetransmitMode::Exact;

        let before = state.messages.len();
        state.messages.retain(|pending| pending.is_fresh(max_age));
        if state.messages.len() >= MAX_QUEUED {
            state.messages.pop_front();
        }
        let dropped = before - state.messages.len();
        if dropped > 0 {
            debug!(dropped, "Dropped held back messages");
        }
        state.messages.push_back(Pending::new(message));
    }

    /// Remembers the last message sent, in case the peer could not read it.
    pub(super) fn remember_sent(&self, message: &[u8]) {
        let mut state = self.lock();
        state.mode = RetransmitMode::None;
        state.messages = VecDeque::from([Pending::new(message)]);
    }

    /// Marks the last message sent for retransmission with a prefix.
    pub(super) fn arm_with_prefix(&self) {
        let mut state = self.lock();
        if state.mode == RetransmitMode::None && !state.messages.is_empty() {
            state.mode = RetransmitMode::WithPrefix;
        }
    }

    /// Takes the pending messages unless they are older than `max_age`.
    fn take(&self, max_age: Duration) -> Option<(RetransmitMode, Vec<Vec<u8>>)> {
        let mut state = self.lock();
        let mode = mem::take(&mut state.mode);
        if mode == RetransmitMode::None {
            return None;
        }

        let pending = mem::take(&mut state.messages);
        let total = pending.len();
        let messages: Vec<Vec<u8>> = pending
            .into_iter()
            .filter(|pending| pending.is_fresh(max_age))
            .map(|pending| pending.message)
            .collect();
        if messages.len() < total {
            debug!(count = total - messages.len(), "Dropping stale messages");
        }
        if messages.is_empty() {
            return None;
        }
        Some((mode, messages))
    }
}

impl Conversation {
    /// Sends again whatever is waiting for retransmission, if it is recent
    /// enough.
    ///
    /// Messages held back by the encryption policy go out unchanged with a
    /// [`MessageEvent::MessageSent`] event. After the peer reported an error,
    /// the last message is resent with the configured prefix and a
    /// [`MessageEvent::MessageResent`] event. Called automatically when a key
    /// exchange completes.
    pub fn maybe_retransmit(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        if !self.is_encrypted() {
            return Ok(Vec::new());
        }
        let Some((mode, messages)) = self.resend.take(self.config.resend_interval) else {
            return Ok(Vec::new());
        };

        let mut to_send = Vec::new();
        for message in &messages {
            if mode == RetransmitMode::WithPrefix {
                let prefixed = [self.config.resend_prefix.as_slice(), message.as_slice()].concat();
                to_send.extend(self.data_message(&prefixed, 0, &[])?);
                self.message_event(MessageEvent::MessageResent, Some(message), None);
            } else {
                to_send.extend(self.data_message(message, 0, &[])?);
                self.message_event(MessageEvent::MessageSent, Some(message), None);
            }
        }

        if let Some(last) = messages.last() {
            self.resend.remember_sent(last);
        }
        debug!(count = messages.len(), ?mode, "Retransmitted messages");
        Ok(to_send)
    }
}
