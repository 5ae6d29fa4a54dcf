pub mod config;
pub mod prometheus;
pub mod vci;
pub mod vnet;
