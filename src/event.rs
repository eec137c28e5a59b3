use arrayvec::ArrayString;

/// Event id reported by protocols that do not recognize an event.
pub const EVENT_ID_INVALID: u32 = 0;

/// Longest symbolic tag an event carries (timer names, leg qualifiers).
pub const MAX_EVENT_TAG: usize = 16;

pub type EventTag = ArrayString<MAX_EVENT_TAG>;

/// Value delivered into a state machine: a numeric identifier from the
/// owning protocol's enumeration, a symbolic name that doubles as a timer
/// tag or event qualifier, and the line/slot the event belongs to.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: u32,
    pub name: EventTag,
    pub line: u8,
}

impl Event {
    /// Builds an event. Tags longer than [`MAX_EVENT_TAG`] bytes are
    /// truncated on a character boundary.
    pub fn new(id: u32, name: &str, line: u8) -> Self {
        let mut tag = EventTag::new();
        if tag.try_push_str(name).is_err() {
            for ch in name.chars() {
                if tag.try_push(ch).is_err() {
                    break;
                }
            }
        }

        Self { id, name: tag, line }
    }

    pub fn is(&self, id: u32) -> bool {
        self.id == id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_construction() {
        let event = Event::new(4, "T10", 1);
        assert_eq!(event.id, 4);
        assert_eq!(event.name.as_str(), "T10");
        assert_eq!(event.line, 1);
        assert!(event.is(4));
        assert!(!event.is(5));
    }

    #[test]
    fn test_oversized_tag_truncated() {
        let event = Event::new(1, "a-tag-well-beyond-sixteen-bytes", 0);
        assert_eq!(event.name.len(), MAX_EVENT_TAG);
    }
}
