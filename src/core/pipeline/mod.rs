pub mod coordinator;
pub mod sessions;
pub mod steps;
