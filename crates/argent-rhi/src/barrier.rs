//! Cross-encoder barrier synthesis.
//!
//! The native API has no standalone cross-pass barrier: an encoder can only
//! be told, at creation, which queue stages it must wait on. A barrier
//! request whose destination encoder does not exist yet is therefore owed:
//! the after-stage mask is parked under each destination class and consumed
//! exactly once when the next encoder of that class is created.

use argent_hal::{PassClass, QueueStages};

#[derive(Default)]
pub struct PendingBarriers {
    entries: [QueueStages; PassClass::ALL.len()],
}

impl PendingBarriers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `after` under every destination class named in `before`.
    pub fn record(&mut self, after: QueueStages, before: QueueStages) {
        for class in PassClass::ALL {
            if before.intersects(class.queue_stage()) {
                self.entries[class.index()] |= after;
            }
        }
    }

    /// Consume the mask owed to one destination class.
    pub fn take(&mut self, class: PassClass) -> QueueStages {
        std::mem::take(&mut self.entries[class.index()])
    }

    /// A render encoder serves both vertex and fragment destinations.
    pub fn take_for_render(&mut self) -> QueueStages {
        self.take(PassClass::Vertex) | self.take(PassClass::Fragment)
    }

    pub fn take_for_compute(&mut self) -> QueueStages {
        self.take(PassClass::Dispatch)
    }

    pub fn take_for_blit(&mut self) -> QueueStages {
        self.take(PassClass::Blit)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_empty())
    }

    pub fn clear(&mut self) {
        self.entries = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_destinations_are_consumed_independently() {
        let mut pending = PendingBarriers::new();
        pending.record(QueueStages::BLIT, QueueStages::DISPATCH);
        pending.record(QueueStages::DISPATCH, QueueStages::FRAGMENT);

        assert_eq!(pending.take_for_compute(), QueueStages::BLIT);
        assert_eq!(pending.take_for_render(), QueueStages::DISPATCH);
        assert!(pending.is_empty());
    }

    #[test]
    fn a_taken_entry_is_not_served_twice() {
        let mut pending = PendingBarriers::new();
        pending.record(QueueStages::VERTEX, QueueStages::DISPATCH);
        assert_eq!(pending.take_for_compute(), QueueStages::VERTEX);
        assert_eq!(pending.take_for_compute(), QueueStages::empty());
    }

    #[test]
    fn repeated_records_accumulate_per_destination() {
        let mut pending = PendingBarriers::new();
        pending.record(QueueStages::VERTEX, QueueStages::BLIT);
        pending.record(QueueStages::DISPATCH, QueueStages::BLIT);
        assert_eq!(
            pending.take_for_blit(),
            QueueStages::VERTEX | QueueStages::DISPATCH
        );
    }

    #[test]
    fn all_destinations_fan_out_to_every_class() {
        let mut pending = PendingBarriers::new();
        pending.record(QueueStages::DISPATCH, QueueStages::all());
        assert_eq!(pending.take_for_render(), QueueStages::DISPATCH);
        assert_eq!(pending.take_for_compute(), QueueStages::DISPATCH);
        assert_eq!(pending.take_for_blit(), QueueStages::DISPATCH);
    }
}
