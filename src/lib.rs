//! Client-side authentication session orchestrator.
//!
//! Decides how this client proves its identity to the backend (`HttpOnly`
//! cookies or bearer tokens), keeps one canonical `AuthState`, collapses
//! concurrent identity checks into one round trip, recovers from
//! self-contradictory identity responses, and gates websocket channels and
//! privileged API calls on the result.
//!
//! ARCHITECTURE
//! ============
//! - [`mode`] picks the credential transport once per session.
//! - [`credentials`] implements the two transports.
//! - [`api`] talks to the backend through the active transport.
//! - [`orchestrator`] owns `AuthState` and is the only place identity is checked.
//! - [`bootstrap`] suspends checks while a login is being finished.
//! - [`hub`] opens channels only for a ready session.
//! - [`session`] wires it all together.

pub mod api;
pub mod backoff;
pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod mode;
pub mod orchestrator;
pub mod session;
pub mod state;
pub mod store;

pub use api::{ApiClient, IdentityApi, IdentityResponse, RequestOptions};
pub use backoff::{BackoffPolicy, with_backoff};
pub use bootstrap::{BootstrapManager, BootstrapState};
pub use config::{AuthConfig, ConfigError};
pub use credentials::{CredentialStrategy, TokenPair};
pub use error::{ApiError, FailureKind};
pub use hub::{ConnectionStatus, HubError, HubEvent, WebSocketHub};
pub use mode::{ModeResolution, ModeResolver, ResolutionSource};
pub use orchestrator::{AuthEvent, AuthOrchestrator, RefreshOptions, Subscription};
pub use session::{AuthSession, LogoutOutcome, SessionError};
pub use state::{AuthMode, AuthSource, AuthState, AuthUser};
