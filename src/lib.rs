pub mod app;
pub mod audit;
pub mod broker;
pub mod cli;
pub mod display;
pub mod mcp;
pub mod model;
pub mod paths;
pub mod secrets;
pub mod server;
pub mod store;
pub mod sync;
