//! Token chain for the Halo Waypoint game-service API
//!
//! Calling Halo Waypoint needs a Spartan token, which is the last link of a chain
//! of short-lived credentials:
//!
//! 1. Microsoft OAuth2 access token
//! 2. Xbox Live user token
//! 3. XSTS ticket, one per relying party
//! 4. Spartan token
//!
//! Every link is cached in memory, persisted through a [`TokenPersister`], and
//! generated at most once at a time no matter how many callers ask for it. When
//! an endpoint rejects its input with a 401, the layer clears the input and
//! regenerates it once.
//!
//! # Example
//!
//! ```no_run
//! use hw_auth::{AuthConfig, FileTokenPersister, StaticAccessToken, TokenChain};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persister = FileTokenPersister::new(FileTokenPersister::default_storage_dir()?).await?;
//!     let chain = TokenChain::new(
//!         AuthConfig::default(),
//!         Arc::new(StaticAccessToken::new("<oauth access token>")),
//!         Arc::new(persister),
//!     )?;
//!
//!     let spartan = chain.spartan_token().await?;
//!     println!("Spartan token valid until {}", spartan.expires_at);
//!
//!     // Xbox Live services take an XBL3.0 header instead
//!     let _authorization = chain.xbox_live_v3_token().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Caches
//!
//! The caches behind the chain are usable on their own:
//!
//! ```
//! use chrono::{DateTime, Utc};
//! use futures::FutureExt;
//! use hw_auth::{Error, Expiring, ExpiryCache};
//! use serde::Deserialize;
//!
//! #[derive(Clone, Deserialize)]
//! struct Ticket {
//!     value: String,
//!     expires_at: DateTime<Utc>,
//! }
//!
//! impl Expiring for Ticket {
//!     fn expires_at(&self) -> DateTime<Utc> {
//!         self.expires_at
//!     }
//! }
//!
//! # async fn example() -> Result<(), Error> {
//! let cache: ExpiryCache<u32, Ticket, Error> = ExpiryCache::in_memory(|n: u32| {
//!     async move {
//!         Ok(Ticket {
//!             value: format!("ticket-{n}"),
//!             expires_at: Utc::now() + chrono::Duration::minutes(5),
//!         })
//!     }
//!     .boxed()
//! });
//!
//! assert_eq!(cache.get_token(1).await?.value, "ticket-1");
//! // Still valid, so the argument of the second call is never used
//! assert_eq!(cache.get_token(2).await?.value, "ticket-1");
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! # Important Notes
//!
//! - Tokens are secrets and are never logged
//! - A token is usable while `expires_at > now + skew`; the skew defaults to zero
//!   and is set with [`AuthConfig::with_expiry_skew`]

pub mod access_token;
pub mod chain;
pub mod client;
pub mod config;
pub mod date_time;
pub mod errors;
pub mod expiry_cache;
pub mod file_store;
pub mod keyed_cache;
pub mod models;
pub mod resolvable;
pub mod retry;
pub mod store;
pub mod tokens;

// Re-export main types
pub use access_token::{AccessTokenProvider, RefreshingAccessToken, StaticAccessToken};
pub use chain::{
    SpartanTokenLayer, SpartanTokenProvider, StaticXstsTicket, TokenChain, UserTokenSource,
    XboxTokenProvider, XboxUserTokenLayer, XstsTicketLayer, XstsTicketSource,
};
pub use client::AuthClient;
pub use config::{AuthConfig, Endpoints, RelyingParty, RetryConfig};
pub use errors::{Error, RequestOrigin, Result, XstsError};
pub use expiry_cache::ExpiryCache;
pub use file_store::FileTokenPersister;
pub use keyed_cache::KeyedExpiryCache;
pub use resolvable::{Abandoned, Resolvable};
pub use retry::{AttemptInput, FailureHookGuard, RetryEvent, RetryPolicy};
pub use store::{MemoryTokenPersister, TokenPersister};
pub use tokens::{Expiring, OAuthToken, SpartanToken, XboxTicket};
