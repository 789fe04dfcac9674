pub mod cli_args;
pub mod ip_net;
pub mod network;
