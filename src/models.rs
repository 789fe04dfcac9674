pub mod blockchain;
pub mod channel;
pub mod peer;
pub mod state;
