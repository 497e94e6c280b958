pub mod sizer;

pub use sizer::{OpenPosition, PositionSizer, SizerInputs, SizerOutcome};
