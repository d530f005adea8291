pub mod cache;
pub mod checksum;
pub mod config;
pub mod semver;
pub mod server;
pub mod upstream;
