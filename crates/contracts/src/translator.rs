//! Interface-id translation between cloud identifiers and dense channel
//! numbers used on hot paths.
//!
//! Append-only: entries are added during single-threaded startup only, so
//! readers never take a lock. The table stays single-digit in practice and
//! linear lookup beats a map.

use crate::{ChannelNumericId, InterfaceId, INVALID_CHANNEL_NUMERIC_ID};

#[derive(Debug, Default, Clone)]
pub struct ChannelIdTranslator {
    lookup: Vec<(ChannelNumericId, InterfaceId)>,
}

impl ChannelIdTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface id, assigning the next dense channel number.
    /// Not safe for concurrent writers; call only during startup.
    pub fn add(&mut self, interface_id: InterfaceId) -> ChannelNumericId {
        let channel = self.lookup.len() as ChannelNumericId;
        self.lookup.push((channel, interface_id));
        channel
    }

    pub fn channel_numeric_id(&self, interface_id: &str) -> ChannelNumericId {
        self.lookup
            .iter()
            .find(|(_, iid)| iid == interface_id)
            .map(|(channel, _)| *channel)
            .unwrap_or(INVALID_CHANNEL_NUMERIC_ID)
    }

    pub fn interface_id(&self, channel: ChannelNumericId) -> Option<&InterfaceId> {
        self.lookup
            .iter()
            .find(|(cid, _)| *cid == channel)
            .map(|(_, iid)| iid)
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_assignment() {
        let mut translator = ChannelIdTranslator::new();
        assert_eq!(translator.add("bus-a".to_string()), 0);
        assert_eq!(translator.add("bus-b".to_string()), 1);
        assert_eq!(translator.channel_numeric_id("bus-a"), 0);
        assert_eq!(translator.channel_numeric_id("bus-b"), 1);
        assert_eq!(translator.interface_id(1), Some(&"bus-b".to_string()));
    }

    #[test]
    fn test_unknown_interface_is_invalid() {
        let translator = ChannelIdTranslator::new();
        assert_eq!(
            translator.channel_numeric_id("nope"),
            INVALID_CHANNEL_NUMERIC_ID
        );
        assert_eq!(translator.interface_id(0), None);
    }
}
