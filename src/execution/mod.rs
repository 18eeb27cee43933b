pub mod monitor;
pub mod order_engine;
pub mod position_manager;

pub use monitor::{MonitorState, PositionMonitor, TickOutcome};
pub use order_engine::{
    floor_order_size, FailureReason, FillReport, OrderIntent, OrderOutcome, OrderRetryEngine,
};
pub use position_manager::{EntryPlan, PositionManager};
