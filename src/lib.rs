pub mod config;
pub mod errors;
pub mod logging;
pub mod ui;
pub mod util;
pub mod workflow;
