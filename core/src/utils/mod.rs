pub mod debounce;
pub mod event_emitter;

pub use debounce::Debouncer;
pub use event_emitter::{ChatEvent, EventEmitter};
