use error::Error;

pub mod clock;
pub mod error;
pub mod event;
pub mod signing_key;

pub type Result<T, E = Error> = std::result::Result<T, E>;
