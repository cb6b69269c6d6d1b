//! Progress broadcasting: the task event bus.

pub mod bus;

pub use bus::TaskEventBus;
