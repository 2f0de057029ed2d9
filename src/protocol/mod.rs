pub mod codec;
pub mod message;
pub mod state;
pub mod stdac;
