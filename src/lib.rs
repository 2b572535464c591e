pub mod engine;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod observability;
pub mod queue;
pub mod wal;
pub mod worker;
