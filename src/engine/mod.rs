pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod session;
