//! An embeddable ESMTP receiver: listener, per-session protocol engine,
//! STARTTLS/implicit TLS, SASL authentication and admission policy, with
//! persistence, filtering and credential checks plugged in from outside.

mod admission;
pub mod auth;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod extensions;
pub mod filter;
pub mod limiter;
pub mod listener;
pub mod reply;
pub mod server;
mod session;
pub mod state;

pub use auth::{AuthOutcome, CredentialVerifier, Credentials, Mechanism, Mechanisms};
pub use command::{Command, MailParameters};
pub use config::{ServerConfig, ServerConfigBuilder, Timeouts, TlsContext, TlsVersion};
pub use events::{EventListener, MessageVerdict, ServerEvent};
pub use filter::MailboxFilter;
pub use limiter::{RateLimitConfig, RateLimiter, TokenBucketLimiter};
pub use listener::Listener;
pub use reply::Reply;
pub use server::{Server, ServerBuilder};
pub use state::State;
