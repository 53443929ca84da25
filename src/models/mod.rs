pub mod config;
pub mod instrument;
pub mod progress;
pub mod record;
pub mod result;
pub mod validation;
