pub mod auth;
pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod registry;
pub mod room;
pub mod server;
pub mod store;
