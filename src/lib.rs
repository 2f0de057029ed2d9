pub mod config;
pub mod control;
pub mod fanout;
pub mod protocol;
pub mod server;
pub mod transceiver;
