pub mod biquad;
pub mod filter_bank;
pub mod ring_buffer;

pub use biquad::{FilterDesign, FilterKind, FilterSpec, Section};
pub use filter_bank::{FilterBank, FilterId, FilterState};
pub use ring_buffer::{RingBuffer, Snapshot};
