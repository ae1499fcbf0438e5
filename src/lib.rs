pub mod admin;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod document;
pub mod error;
pub mod flow;
pub mod logger;
pub mod message;
pub mod node;
pub mod nodes;
pub mod runtime;
pub mod schema;
pub mod secret;
pub mod services;
pub mod store;
