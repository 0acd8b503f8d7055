//! Authorized requests to Halo Waypoint and Xbox Live services
//!
//! [`RequestExecutor`] attaches the current token from an `hw-auth` provider to
//! every request. When the service answers 401 the token is invalidated and the
//! request is sent once more; the chain below regenerates only the layer that
//! went stale.
//!
//! # Example
//!
//! ```no_run
//! use hw_auth::{AuthConfig, MemoryTokenPersister, StaticAccessToken, TokenChain};
//! use hw_client::{endpoints, RequestExecutor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AuthConfig::default();
//!     let chain = TokenChain::new(
//!         config.clone(),
//!         Arc::new(StaticAccessToken::new("<oauth access token>")),
//!         Arc::new(MemoryTokenPersister::new()),
//!     )?;
//!
//!     let halo = RequestExecutor::halo(&config, Arc::new(chain))?;
//!     let url = endpoints::service_url(endpoints::origins::PROFILE, "/users/gt(Chief)")?;
//!     let user: serde_json::Value = halo.get_json(url).await?;
//!     println!("{user}");
//!     Ok(())
//! }
//! ```

pub mod endpoints;
pub mod executor;

pub use executor::{
    RequestAuthorizer, RequestExecutor, SpartanAuthorizer, XboxLiveAuthorizer, SPARTAN_HEADER,
};
