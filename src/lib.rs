pub mod booking;
pub mod config;
pub mod fanout;
pub mod limits;
pub mod model;
pub mod observability;
pub mod rooms;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod wal;
