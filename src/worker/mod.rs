pub mod email;
pub mod import;

pub use email::EmailWorker;
pub use import::{ImportSummary, ImportWorker};
