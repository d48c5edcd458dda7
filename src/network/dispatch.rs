// Handler table keyed by message type tag
// Handlers run on the thread that drains the client's events, in arrival order

use std::collections::HashMap;
use tracing::warn;

use super::protocol::{PeerMessage, ServerMessage};

/// Anything carrying a `type` tag
pub trait Tagged {
    fn tag(&self) -> &str;
}

impl Tagged for ServerMessage {
    fn tag(&self) -> &str {
        self.kind()
    }
}

impl Tagged for PeerMessage {
    fn tag(&self) -> &str {
        self.kind()
    }
}

type Handler<M> = Box<dyn FnMut(&M)>;

pub struct Dispatcher<M> {
    /// Channel name used in log lines
    label: &'static str,
    handlers: HashMap<String, Handler<M>>,
}

impl<M: Tagged> Dispatcher<M> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a tag, replacing any previous one
    pub fn on(&mut self, tag: &str, handler: impl FnMut(&M) + 'static) -> &mut Self {
        self.handlers.insert(tag.to_string(), Box::new(handler));
        self
    }

    pub fn off(&mut self, tag: &str) -> bool {
        self.handlers.remove(tag).is_some()
    }

    pub fn has(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Run the handler for this message's tag.
    /// Unregistered tags are logged and dropped; returns whether a handler ran.
    pub fn dispatch(&mut self, message: &M) -> bool {
        match self.handlers.get_mut(message.tag()) {
            Some(handler) => {
                handler(message);
                true
            }
            None => {
                warn!("{}: unknown message type: {}", self.label, message.tag());
                false
            }
        }
    }
}
