use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

/// Largest tag handed out. Tags stay within the non-negative range of a
/// 32-bit signed integer; negative tags are reserved as failure markers.
pub const MAX_DELIVERY_TAG: u32 = i32::MAX as u32;

/// Locally assigned identifier of one in-flight transmission.
///
/// Unique among messages that are in flight at the same time, reused after
/// wraparound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u32);

impl DeliveryTag {
    /// Build a tag, rejecting values outside `0..=MAX_DELIVERY_TAG`.
    pub fn new(value: u32) -> Option<Self> {
        (value <= MAX_DELIVERY_TAG).then_some(Self(value))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Tag as sent on the wire: the ASCII decimal rendering of its value.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }

    /// Parse a tag from its wire form.
    pub fn from_wire_bytes(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes)
            .ok()?
            .parse::<u32>()
            .ok()
            .and_then(Self::new)
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic delivery tag counter, wrapping to zero after
/// [`MAX_DELIVERY_TAG`].
#[derive(Debug, Default)]
pub struct TagAllocator {
    next: AtomicU32,
}

impl TagAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose first tag is `first`.
    ///
    /// A value past [`MAX_DELIVERY_TAG`] is treated as already wrapped.
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Return the current tag and advance the counter.
    pub fn next(&self) -> DeliveryTag {
        let previous = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(advance(normalize(current)))
            })
            .unwrap_or_else(|current| current);

        DeliveryTag(normalize(previous))
    }
}

fn normalize(value: u32) -> u32 {
    if value > MAX_DELIVERY_TAG { 0 } else { value }
}

fn advance(value: u32) -> u32 {
    if value == MAX_DELIVERY_TAG { 0 } else { value + 1 }
}
