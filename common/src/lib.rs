pub mod bench;
pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod output;
pub mod template;
pub mod trace;
pub mod util;
