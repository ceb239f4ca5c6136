pub mod broadcast;
pub mod kafka;
pub mod memory;
pub mod prometheus;
pub mod sqlite;
pub mod vault;
