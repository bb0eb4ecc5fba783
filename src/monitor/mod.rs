//! Hidden stop/target enforcement: the scheduler watches open positions, the
//! breach detector decides, and the orchestrator closes.

pub mod breach;
pub mod inflight;
pub mod methods;
pub mod orchestrator;
pub mod ports;
pub mod scheduler;

pub use breach::{detect, BreachResult};
pub use methods::{CloseMethod, MethodKind, ViaDirectBroker, ViaTerminalQueue};
pub use orchestrator::{
    AckOutcome, CloseDisposition, CloseOrchestrator, CloseResult, OverrideMode,
    PositionActionError,
};
pub use ports::{CommandQueue, PositionLedger, SignalBook};
pub use scheduler::{MonitorHandle, MonitorScheduler, SchedulerConfig, SchedulerState, TickReport};
