//! Scheduling events and the bus that distributes them.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod scheduling;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use scheduling::{SchedulingEnvelope, SchedulingEvent};
