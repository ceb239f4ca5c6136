pub mod backoffice;
pub mod cron;
pub mod event;
pub mod jwks;
pub mod signing_key;
