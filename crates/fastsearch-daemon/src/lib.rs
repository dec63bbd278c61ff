pub mod client;
pub mod lifecycle;
pub mod server;

pub use lifecycle::run_daemon;
pub use server::Daemon;
