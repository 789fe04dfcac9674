pub mod peer_registry;
