// id.rs — Stable identifiers for one compilation unit
//
// Stage ids index the stage arena in declaration order. Wrapper serials make
// synthesized wrapper names unique across every wrap request of the unit,
// whatever the source or reader set.

/// Stable identifier for a stage (index into the stage arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

/// Serial number of a synthesized wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WrapSerial(pub u32);

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation order, ensuring deterministic naming.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_stage: u32,
    next_wrapper: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_stage(&mut self) -> StageId {
        let id = StageId(self.next_stage);
        self.next_stage += 1;
        id
    }

    pub fn alloc_wrapper(&mut self) -> WrapSerial {
        let id = WrapSerial(self.next_wrapper);
        self.next_wrapper += 1;
        id
    }

    /// The serial the next `alloc_wrapper` call will return, without taking it.
    pub fn peek_wrapper(&self) -> WrapSerial {
        WrapSerial(self.next_wrapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_serials_increase() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.peek_wrapper(), WrapSerial(0));
        assert_eq!(ids.alloc_wrapper(), WrapSerial(0));
        assert_eq!(ids.alloc_wrapper(), WrapSerial(1));
        assert_eq!(ids.alloc_stage(), StageId(0));
        assert_eq!(ids.peek_wrapper(), WrapSerial(2));
    }
}
