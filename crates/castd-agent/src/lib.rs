pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logs;
pub mod reaper;
pub mod registry;
pub mod source;
pub mod stats;
pub mod supervisor;
pub mod waiter;
pub mod worker;

pub use lifecycle::StartOutcome;
pub use supervisor::Supervisor;
