// Offline-resilient message delivery for the roshLingua chat client
pub mod backend;
pub mod config;
pub mod models;
pub mod notifications;
pub mod session;
pub mod storage;

// Re-export main types for convenience
pub use backend::{DeliveryService, Outbox, SendOutcome};
pub use config::ClientConfig;
pub use models::*;
