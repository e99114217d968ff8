use crate::wire::Frame;
use crypto::base58_encode;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;

/// Generate a message id: short, unique, well under the 64 character cap.
pub fn message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base58_encode(&bytes)
}

/// Reply a handler chose for the frame it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack(String),
}

pub(crate) type ReplySlot = Arc<Mutex<Option<Reply>>>;

/// An event as handed to a registered handler.
///
/// `ack`/`nack` override the reply frame the engine would otherwise send;
/// calling neither acknowledges the frame once the handler returns Ok.
#[derive(Clone)]
pub struct Event {
    pub from: String,
    pub to: String,
    pub service: String,
    pub event: String,
    pub id: String,
    pub content: Vec<u8>,
    pub data: Vec<u8>,
    pub file: Option<Vec<u8>>,
    /// Local user owning the recipient identity; `None` for broadcasts.
    pub user: Option<String>,
    reply: ReplySlot,
}

impl Event {
    pub(crate) fn from_frame(frame: Frame, user: Option<String>) -> (Self, ReplySlot) {
        let reply: ReplySlot = Arc::new(Mutex::new(None));
        let event = Event {
            from: frame.headers.from,
            to: frame.headers.to,
            service: frame.headers.service,
            event: frame.headers.event,
            id: frame.headers.id,
            content: frame.content,
            data: frame.data,
            file: frame.file,
            user,
            reply: reply.clone(),
        };
        (event, reply)
    }

    pub fn ack(&self) {
        *self.reply.lock() = Some(Reply::Ack);
    }

    pub fn nack(&self, reason: &str) {
        *self.reply.lock() = Some(Reply::Nack(reason.to_owned()));
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("service", &self.service)
            .field("event", &self.event)
            .field("id", &self.id)
            .field("content", &self.content.len())
            .field("data", &self.data.len())
            .field("user", &self.user)
            .finish()
    }
}

/// What callers hand to [`crate::Engine::send`]. An empty `to` broadcasts on
/// the messages topic; an empty `from` sends anonymously.
#[derive(Debug, Clone, Default)]
pub struct OutboundEvent {
    pub from: String,
    pub to: String,
    pub service: String,
    pub event: String,
    pub content: Vec<u8>,
    pub data: Vec<u8>,
    pub file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_short_and_unique() {
        let a = message_id();
        let b = message_id();
        assert_ne!(a, b);
        assert!(a.len() <= 64);
    }

    #[test]
    fn reply_slot_tracks_handler_choice() {
        let (event, slot) = Event::from_frame(Frame::default(), None);
        assert_eq!(*slot.lock(), None);
        event.ack();
        assert_eq!(*slot.lock(), Some(Reply::Ack));
        event.nack("bad payload");
        assert_eq!(*slot.lock(), Some(Reply::Nack("bad payload".to_owned())));
    }
}
