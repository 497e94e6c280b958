pub mod service;

pub use service::{BrokerState, ValidationService};
