//! Multi-account selection and circuit breaking for a chat-completion API
//!
//! Maintains a registry of independent accounts (session-key or OAuth),
//! tracks per-account health through a four-state circuit breaker, refreshes
//! quota usage, and routes each request to the best-suited account. The
//! credentials file is hot-reloaded and reconciled against live health state.
//!
//! Request lifecycle:
//! 1. Caller hands an operation to the `Executor`
//! 2. Stale usage is refreshed; the `HealthMonitor` ranks the candidates
//! 3. Authentication is bound (session key, or a token from the manager)
//! 4. The operation runs exactly once; its outcome is classified and
//!    recorded, moving the account through the breaker state machine
//! 5. Orthogonally, the `CredentialsWatcher` swaps the registry snapshot
//!    whenever the credentials document changes on disk
//!
//! The executor owns the composition; no component holds a back-reference to
//! it, and a process may host several independent cores.

pub mod classify;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod executor;
pub mod fetch;
pub mod health;
pub mod monitor;
pub mod refresh;
pub mod store;
pub mod usage;
pub mod watch;

pub use classify::{FailureKind, Outcome, classify_message, classify_status, is_transient};
pub use config::CircuitBreakerConfig;
pub use credentials::{AuthMaterial, Credential, CredentialsSnapshot, SharedCredentials};
pub use error::{Error, Result, TransportError};
pub use events::{EventSink, PoolEvent, TracingSink};
pub use executor::{AuthContext, Executor};
pub use fetch::HttpUsageFetcher;
pub use health::{AccountHealth, HealthState, Transition};
pub use monitor::HealthMonitor;
pub use refresh::{ListenerId, UsageListener, UsageRefresher, UsageUpdateEvent};
pub use store::CredentialsDocument;
pub use usage::{UsageData, UsageFetcher, UsageWindow};
pub use watch::{CredentialsWatcher, WatcherHandle};
