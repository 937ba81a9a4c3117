//! Message dispatch by type tag.
//!
//! The transport treats payloads as opaque bytes. Applications that
//! multiplex several message kinds over one connection can frame each
//! payload as `tag(u16) || body` and register one handler per tag; dispatch
//! is a single map lookup. Unknown tags surface as an error rather than
//! being dropped, since they usually mean a version skew between peers.

use std::collections::HashMap;

use crate::error::{ProtocolError, Result};

/// Handler for one message tag.
pub type DispatchHandler<C> = Box<dyn FnMut(&mut C, &[u8]) -> Result<()> + Send>;

/// Frame a body with its type tag.
pub fn encode_frame(tag: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Registry mapping message tags to handlers, populated at startup.
pub struct MessageDispatcher<C> {
    handlers: HashMap<u16, DispatchHandler<C>>,
}

impl<C> MessageDispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a tag, replacing any previous one.
    pub fn register<F>(&mut self, tag: u16, handler: F)
    where
        F: FnMut(&mut C, &[u8]) -> Result<()> + Send + 'static,
    {
        self.handlers.insert(tag, Box::new(handler));
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decode a frame and invoke the matching handler.
    pub fn dispatch(&mut self, ctx: &mut C, frame: &[u8]) -> Result<()> {
        if frame.len() < 2 {
            return Err(ProtocolError::MalformedPacket("frame too short for tag".into()).into());
        }
        let tag = u16::from_be_bytes([frame[0], frame[1]]);
        let handler = self
            .handlers
            .get_mut(&tag)
            .ok_or(ProtocolError::UnknownMessageTag(tag))?;
        handler(ctx, &frame[2..])
    }
}

impl<C> Default for MessageDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct World {
        moves: Vec<Vec<u8>>,
        chats: Vec<String>,
    }

    fn dispatcher() -> MessageDispatcher<World> {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher.register(1, |world: &mut World, body: &[u8]| {
            world.moves.push(body.to_vec());
            Ok(())
        });
        dispatcher.register(2, |world: &mut World, body: &[u8]| {
            world.chats.push(String::from_utf8_lossy(body).into_owned());
            Ok(())
        });
        dispatcher
    }

    #[test]
    fn test_dispatch_routes_by_tag() {
        let mut world = World::default();
        let mut dispatcher = dispatcher();

        dispatcher
            .dispatch(&mut world, &encode_frame(1, &[4, 2]))
            .unwrap();
        dispatcher
            .dispatch(&mut world, &encode_frame(2, b"hello"))
            .unwrap();

        assert_eq!(world.moves, vec![vec![4, 2]]);
        assert_eq!(world.chats, vec!["hello".to_string()]);
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let mut world = World::default();
        let mut dispatcher = dispatcher();

        let err = dispatcher
            .dispatch(&mut world, &encode_frame(9, b""))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnknownMessageTag(9))
        ));
    }

    #[test]
    fn test_short_frame_is_error() {
        let mut world = World::default();
        let mut dispatcher = dispatcher();
        assert!(dispatcher.dispatch(&mut world, &[1]).is_err());
    }

    #[test]
    fn test_register_replaces() {
        let mut world = World::default();
        let mut dispatcher = dispatcher();
        dispatcher.register(1, |_world: &mut World, _body: &[u8]| Ok(()));

        dispatcher
            .dispatch(&mut world, &encode_frame(1, &[7]))
            .unwrap();
        assert!(world.moves.is_empty());
    }
}
