pub mod cli;
pub mod convertor;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod protocol;
pub mod registry;
pub mod statistics;
pub mod store;
pub mod transport;
pub mod web;
