pub mod config;
pub mod forward;
pub mod intake;
pub mod policy;
pub mod relay;
pub mod replay;
pub mod scorer;
pub mod statistics;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use forward::{ForwardError, Forwarder, SmtpForwarder};
pub use intake::{Intake, WorkUnit};
pub use relay::Relay;
pub use replay::ReplayMessage;
pub use scorer::{ScoreResult, Scorer, SpamdClient};
pub use statistics::{StatEvent, StatisticsCollector};
pub use store::{Disposition, Store, StoreRecord};
pub use worker::{Outcome, Pipeline};
