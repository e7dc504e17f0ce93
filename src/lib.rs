pub mod actor;
pub mod amount;
pub mod app;
pub mod breaker;
pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod csv;
pub mod failure;
pub mod guard;
pub mod ledger;
pub mod model;
pub mod money;
pub mod worker;

pub use amount::Amount;
pub use app::App;
pub use coordinator::Coordinator;
pub use ledger::LedgerStore;
pub use model::{Signal, TxId, TxStatus};
