use crate::event::Event;

/// Multi-producer output channel with reserve-then-publish writes.
///
/// `reserve` never blocks: a full channel returns `None` and the caller drops
/// the event.
pub trait EventChannel {
    type Slot<T: Event>: EventSlot<T>;

    fn reserve<T: Event>(&self) -> Option<Self::Slot<T>>;
}

/// Space reserved on an [`EventChannel`]. Must end in `commit` or `discard`.
pub trait EventSlot<T: Event> {
    /// Zero-fills the slot and hands it out for population.
    fn zeroed(&mut self) -> &mut T;

    /// Publishes the slot to the consumer.
    fn commit(self);

    /// Gives the space back without publishing.
    fn discard(self);
}
