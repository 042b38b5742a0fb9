pub mod auth;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod messages;
pub mod registry;
pub mod room;
pub mod routes;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod ws;
