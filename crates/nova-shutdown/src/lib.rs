pub mod coordinator;
pub mod signal;

pub use coordinator::{ShutdownCoordinator, ShutdownCoordinatorBuilder, ShutdownPhase};
pub use signal::{ShutdownListener, ShutdownSignal, SignalHandler};
