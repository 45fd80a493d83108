pub mod channel;
pub mod letta;
pub mod manager;
pub mod recovery;
pub mod scheduler;
pub mod secrets;
pub mod status;
pub mod tools;
pub mod triggers;
pub mod vault;
