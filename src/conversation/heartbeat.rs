use super::Conversation;
use crate::Error;
use crate::data_message::FLAG_IGNORE_UNREADABLE;
use crate::event::MessageEvent;
use tracing::trace;

impl Conversation {
    /// Sends an empty data message when nothing was sent for longer than the
    /// heartbeat interval, so that the peer can rotate its keys.
    ///
    /// Also checked after every received data message carrying text.
    pub fn maybe_heartbeat(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        if !self.is_encrypted() {
            return Ok(Vec::new());
        }

        let due = self
            .last_sent
            .is_some_and(|sent| sent.elapsed() >= self.config.heartbeat_interval);
        if !due {
            return Ok(Vec::new());
        }

        let to_send = self.data_message(b"", FLAG_IGNORE_UNREADABLE, &[])?;
        trace!("Sent heartbeat");
        self.message_event(MessageEvent::LogHeartbeatSent, None, None);
        Ok(to_send)
    }
}
