pub mod manager;

pub use manager::{spawn_analysis_driver, SignalManager, SignalManagerDeps};
