//! Library crate for staresc-rs: remote privilege-escalation checks over
//! SSH and Telnet, driven by YAML plugins.
pub mod config;
pub mod error;
pub mod output;
pub mod plugin;
pub mod scanner;
pub mod session;
pub mod target;
pub mod target_list;
pub mod worker;

pub use config::{RawJob, ScanOptions};
pub use error::{Result, StarescError};
pub use output::{Output, ResultSink};
pub use plugin::{load_plugins_from_dir, Plugin};
pub use scanner::{check_targets, raw_targets, scan_targets, CheckStatus, ScanReport};
pub use session::{open_session, Session};
pub use target::ConnectionString;
