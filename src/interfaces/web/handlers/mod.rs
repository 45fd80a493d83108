pub mod bots;
pub mod memory;
pub mod secrets;
pub mod tools;
pub mod triggers;
