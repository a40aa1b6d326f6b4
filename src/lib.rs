pub mod auth;
pub mod booking;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod settings;
pub mod store;
pub mod wal;
pub mod wire;
