pub mod builtin;
pub mod catalog;
pub mod discovery;
pub mod dispatch;
pub mod loading;
pub mod orchestrator;
pub mod usage;
