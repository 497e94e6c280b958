pub mod entry_executor;
pub mod exit_detector;
pub mod exit_executor;
pub mod reconciler;

pub use entry_executor::{EntryExecutor, EntryJob};
pub use exit_detector::ExitDetector;
pub use exit_executor::{ExitExecutor, ExitQualifier, ExitVerdict};
pub use reconciler::{EntryReconciler, ExitReconciler};
