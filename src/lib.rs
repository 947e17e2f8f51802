//! Plex Resolver
//!
//! Signs a user in to plex.tv with a PIN, discovers their media servers,
//! finds a (url, token) pair that actually answers, and saves it for the
//! playlist scripts.

pub mod audit;
pub mod candidates;
pub mod check;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod prober;
pub mod provider;
pub mod scripts;
pub mod server;
pub mod session;
pub mod store;
pub mod token;

pub use config::EngineConfig;
pub use coordinator::{Coordinator, PollOutcome, SaveOutcome, SaveRequest, StartOutcome};
pub use error::{ResolveError, Result, StoreError};
pub use session::{SessionContext, SessionRegistry};
pub use store::{ConfigStore, EnvFileStore, ResolvedCredential};
pub use token::{AccessToken, TokenSource};
