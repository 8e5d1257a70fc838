pub mod registry;
pub mod repository;
pub mod robot_store;
pub mod supervisor;
pub mod worker;

pub use registry::{
    DeliverySender, FanoutRegistry, RuntimeSnapshot, SubscriberConnection, WorkerTicket,
};
pub use repository::{RobotFilter, RobotRepository};
pub use robot_store::RobotStore;
pub use supervisor::{ReconcileReport, Supervisor};
pub use worker::{Deal, TradeMachine, TradePhase, TradingWorker, WorkerContext, WorkerExit};
