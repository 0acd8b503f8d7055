//! The four-layer token chain.
//!
//! ```text
//! OAuth2 access token -> Xbox user token -> XSTS ticket (per relying party) -> Spartan token
//! ```
//!
//! Each layer caches its token, persists every token it generates, and asks
//! the layer below for a fresh input when its own endpoint answers 401.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, instrument, warn};

use crate::access_token::AccessTokenProvider;
use crate::client::AuthClient;
use crate::config::{AuthConfig, RelyingParty};
use crate::errors::{Error, RequestOrigin, Result};
use crate::expiry_cache::ExpiryCache;
use crate::keyed_cache::KeyedExpiryCache;
use crate::models::{DisplayClaims, XboxUserClaims};
use crate::retry::{AttemptInput, RetryEvent, RetryPolicy};
use crate::store::{persist, TokenPersister};
use crate::tokens::{Expiring, SpartanToken, XboxTicket};

pub const USER_TOKEN_NAME: &str = "xbox.userToken";
pub const SPARTAN_TOKEN_NAME: &str = "halo.authToken";

/// Durable record name of the XSTS ticket for `relying_party`
pub fn xsts_ticket_name(relying_party: RelyingParty) -> String {
    format!("xbox.xstsTicket.{}", relying_party.as_str())
}

/// Layer 1
#[async_trait::async_trait]
pub trait UserTokenSource: Send + Sync {
    async fn user_token(&self) -> Result<XboxTicket>;
    async fn clear_user_token(&self) -> Result<()>;

    /// Clear the user token only if it is still `stale`; returns whether it was cleared
    async fn clear_user_token_if(&self, _stale: &str) -> Result<bool> {
        self.clear_user_token().await?;
        Ok(true)
    }
}

/// Layer 2
#[async_trait::async_trait]
pub trait XstsTicketSource: Send + Sync {
    async fn xsts_ticket(&self, relying_party: RelyingParty) -> Result<XboxTicket>;
    async fn clear_xsts_ticket(&self, relying_party: RelyingParty) -> Result<()>;

    /// Clear the ticket only if it is still `stale`; returns whether it was cleared
    async fn clear_xsts_ticket_if(&self, relying_party: RelyingParty, _stale: &str) -> Result<bool> {
        self.clear_xsts_ticket(relying_party).await?;
        Ok(true)
    }
}

/// Layer 3, the token attached to Halo Waypoint requests
#[async_trait::async_trait]
pub trait SpartanTokenProvider: Send + Sync {
    async fn spartan_token(&self) -> Result<SpartanToken>;
    async fn clear_spartan_token(&self) -> Result<()>;
    /// Expiry of the stored token, without generating one
    async fn current_expiration(&self) -> Result<Option<DateTime<Utc>>>;

    /// Clear the token only if it is still `stale`; returns whether it was cleared
    async fn clear_spartan_token_if(&self, _stale: &str) -> Result<bool> {
        self.clear_spartan_token().await?;
        Ok(true)
    }
}

/// `XBL3.0` authorization for Xbox Live services
#[async_trait::async_trait]
pub trait XboxTokenProvider: Send + Sync {
    async fn xbox_live_v3_token(&self) -> Result<String>;
    async fn clear_xbox_live_v3_token(&self) -> Result<()>;

    /// Clear the ticket behind `stale` unless it was already replaced
    async fn clear_xbox_live_v3_token_if(&self, _stale: &str) -> Result<bool> {
        self.clear_xbox_live_v3_token().await?;
        Ok(true)
    }
}

/// Xbox Live user token, generated from the Layer 0 access token
pub struct XboxUserTokenLayer {
    cache: ExpiryCache<(), XboxTicket, Error>,
    persister: Arc<dyn TokenPersister>,
}

impl XboxUserTokenLayer {
    pub fn new(
        client: AuthClient,
        access: Arc<dyn AccessTokenProvider>,
        persister: Arc<dyn TokenPersister>,
    ) -> Self {
        let skew = client.config().expiry_skew;

        let generate = {
            let persister = Arc::clone(&persister);
            move |()| {
                let client = client.clone();
                let access = Arc::clone(&access);
                let persister = Arc::clone(&persister);
                async move {
                    let access_token = access.access_token().await?;
                    let ticket = client.user_token(&access_token).await?;
                    persist(persister.as_ref(), USER_TOKEN_NAME, &ticket).await?;
                    debug!("Generated Xbox user token");
                    Ok(ticket)
                }
                .boxed()
            }
        };

        let load_existing = {
            let persister = Arc::clone(&persister);
            move || {
                let persister = Arc::clone(&persister);
                async move { persister.load(USER_TOKEN_NAME).await }.boxed()
            }
        };

        Self {
            cache: ExpiryCache::new(generate, load_existing).with_expiry_skew(skew),
            persister,
        }
    }
}

#[async_trait::async_trait]
impl UserTokenSource for XboxUserTokenLayer {
    async fn user_token(&self) -> Result<XboxTicket> {
        self.cache.get_token(()).await
    }

    async fn clear_user_token(&self) -> Result<()> {
        debug!("Clearing Xbox user token");
        self.persister.clear(USER_TOKEN_NAME).await?;
        self.cache.clear_token();
        Ok(())
    }

    async fn clear_user_token_if(&self, stale: &str) -> Result<bool> {
        let matches = |cached: &XboxTicket| cached.token == stale;
        if !self.cache.holds_token(matches) {
            debug!("Xbox user token was already replaced");
            return Ok(false);
        }

        debug!("Clearing rejected Xbox user token");
        self.persister.clear(USER_TOKEN_NAME).await?;
        Ok(self.cache.clear_token_if(matches))
    }
}

/// XSTS tickets, one slot per relying party
///
/// A 401 from XSTS clears the user token and retries once.
pub struct XstsTicketLayer {
    cache: KeyedExpiryCache<RelyingParty, (), XboxTicket, Error>,
    persister: Arc<dyn TokenPersister>,
}

impl XstsTicketLayer {
    pub fn new(
        client: AuthClient,
        user: Arc<dyn UserTokenSource>,
        persister: Arc<dyn TokenPersister>,
    ) -> Self {
        let skew = client.config().expiry_skew;
        let retry = Arc::new(RetryPolicy::new(&client.config().retry, |e: &Error| {
            e.is_unauthorized_from(RequestOrigin::XstsAuthorization)
        }));

        let generate = {
            let persister = Arc::clone(&persister);
            move |relying_party: RelyingParty, ()| {
                let client = client.clone();
                let user = Arc::clone(&user);
                let persister = Arc::clone(&persister);
                let retry = Arc::clone(&retry);
                async move {
                    let attempted = AttemptInput::<String>::new();
                    let clear_user = {
                        let user = Arc::clone(&user);
                        let attempted = attempted.clone();
                        move |_: &Error, event: RetryEvent| {
                            let user = Arc::clone(&user);
                            let stale = attempted.take();
                            async move {
                                debug!(attempt = event.attempt, "XSTS rejected the user token, clearing it");
                                match stale {
                                    Some(stale) => user.clear_user_token_if(&stale).await.map(|_| ()),
                                    None => Ok(()),
                                }
                            }
                            .boxed()
                        }
                    };
                    let ticket = retry
                        .execute_with_hook(clear_user, || async {
                            let user_token = user.user_token().await?;
                            attempted.record(user_token.token.clone());
                            client.xsts_ticket(&user_token.token, relying_party).await
                        })
                        .await?;
                    persist(persister.as_ref(), &xsts_ticket_name(relying_party), &ticket).await?;
                    debug!(%relying_party, "Generated XSTS ticket");
                    Ok(ticket)
                }
                .boxed()
            }
        };

        let load_existing = {
            let persister = Arc::clone(&persister);
            move |relying_party: RelyingParty| {
                let persister = Arc::clone(&persister);
                async move { persister.load(&xsts_ticket_name(relying_party)).await }.boxed()
            }
        };

        Self {
            cache: KeyedExpiryCache::new(generate, load_existing).with_expiry_skew(skew),
            persister,
        }
    }
}

#[async_trait::async_trait]
impl XstsTicketSource for XstsTicketLayer {
    async fn xsts_ticket(&self, relying_party: RelyingParty) -> Result<XboxTicket> {
        self.cache.get_token(relying_party, ()).await
    }

    async fn clear_xsts_ticket(&self, relying_party: RelyingParty) -> Result<()> {
        debug!(%relying_party, "Clearing XSTS ticket");
        self.persister.clear(&xsts_ticket_name(relying_party)).await?;
        self.cache.clear_token(&relying_party);
        Ok(())
    }

    async fn clear_xsts_ticket_if(&self, relying_party: RelyingParty, stale: &str) -> Result<bool> {
        let matches = |cached: &XboxTicket| cached.token == stale;
        if !self.cache.holds_token(&relying_party, matches) {
            debug!(%relying_party, "XSTS ticket was already replaced");
            return Ok(false);
        }

        debug!(%relying_party, "Clearing rejected XSTS ticket");
        self.persister.clear(&xsts_ticket_name(relying_party)).await?;
        Ok(self.cache.clear_token_if(&relying_party, matches))
    }
}

/// A pre-issued XSTS ticket used for every relying party
///
/// It never expires from the chain's point of view and cannot be regenerated,
/// so clearing it only logs.
#[derive(Clone)]
pub struct StaticXstsTicket {
    ticket: XboxTicket,
}

impl StaticXstsTicket {
    pub fn new(token: impl Into<String>, user_hash: impl Into<String>) -> Self {
        Self {
            ticket: XboxTicket {
                token: token.into(),
                issued_at: None,
                expires_at: DateTime::<Utc>::MAX_UTC,
                display_claims: DisplayClaims {
                    xui: vec![XboxUserClaims {
                        uhs: user_hash.into(),
                        xid: None,
                        gtg: None,
                        agg: None,
                        usr: None,
                        utr: None,
                        prv: None,
                    }],
                },
            },
        }
    }
}

impl std::fmt::Debug for StaticXstsTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticXstsTicket")
            .field("user_hash", &self.ticket.user_hash())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl XstsTicketSource for StaticXstsTicket {
    async fn xsts_ticket(&self, _relying_party: RelyingParty) -> Result<XboxTicket> {
        Ok(self.ticket.clone())
    }

    async fn clear_xsts_ticket(&self, relying_party: RelyingParty) -> Result<()> {
        warn!(%relying_party, "Static XSTS ticket cannot be cleared or regenerated");
        Ok(())
    }
}

/// Spartan tokens, generated from the Halo relying party's XSTS ticket
///
/// A 401 from the spartan-token endpoint clears that XSTS ticket and retries once.
pub struct SpartanTokenLayer {
    cache: ExpiryCache<(), SpartanToken, Error>,
    persister: Arc<dyn TokenPersister>,
}

impl SpartanTokenLayer {
    pub fn new(
        client: AuthClient,
        xsts: Arc<dyn XstsTicketSource>,
        persister: Arc<dyn TokenPersister>,
    ) -> Self {
        let skew = client.config().expiry_skew;
        let retry = Arc::new(RetryPolicy::new(&client.config().retry, |e: &Error| {
            e.is_unauthorized_from(RequestOrigin::SpartanToken)
        }));

        let generate = {
            let persister = Arc::clone(&persister);
            move |()| {
                let client = client.clone();
                let xsts = Arc::clone(&xsts);
                let persister = Arc::clone(&persister);
                let retry = Arc::clone(&retry);
                async move {
                    let attempted = AttemptInput::<String>::new();
                    let clear_ticket = {
                        let xsts = Arc::clone(&xsts);
                        let attempted = attempted.clone();
                        move |_: &Error, event: RetryEvent| {
                            let xsts = Arc::clone(&xsts);
                            let stale = attempted.take();
                            async move {
                                debug!(attempt = event.attempt, "Spartan token exchange rejected the XSTS ticket, clearing it");
                                match stale {
                                    Some(stale) => xsts
                                        .clear_xsts_ticket_if(RelyingParty::Halo, &stale)
                                        .await
                                        .map(|_| ()),
                                    None => Ok(()),
                                }
                            }
                            .boxed()
                        }
                    };
                    let token = retry
                        .execute_with_hook(clear_ticket, || async {
                            let ticket = xsts.xsts_ticket(RelyingParty::Halo).await?;
                            attempted.record(ticket.token.clone());
                            client.spartan_token(&ticket).await
                        })
                        .await?;
                    persist(persister.as_ref(), SPARTAN_TOKEN_NAME, &token).await?;
                    debug!(expires_at = %token.expires_at, "Generated Spartan token");
                    Ok(token)
                }
                .boxed()
            }
        };

        let load_existing = {
            let persister = Arc::clone(&persister);
            move || {
                let persister = Arc::clone(&persister);
                async move { persister.load(SPARTAN_TOKEN_NAME).await }.boxed()
            }
        };

        Self {
            cache: ExpiryCache::new(generate, load_existing).with_expiry_skew(skew),
            persister,
        }
    }
}

#[async_trait::async_trait]
impl SpartanTokenProvider for SpartanTokenLayer {
    async fn spartan_token(&self) -> Result<SpartanToken> {
        self.cache.get_token(()).await
    }

    async fn clear_spartan_token(&self) -> Result<()> {
        debug!("Clearing Spartan token");
        self.persister.clear(SPARTAN_TOKEN_NAME).await?;
        self.cache.clear_token();
        Ok(())
    }

    async fn current_expiration(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .cache
            .get_existing_token()
            .await?
            .map(|token| token.expires_at()))
    }

    async fn clear_spartan_token_if(&self, stale: &str) -> Result<bool> {
        let matches = |cached: &SpartanToken| cached.token == stale;
        if !self.cache.holds_token(matches) {
            debug!("Spartan token was already replaced");
            return Ok(false);
        }

        debug!("Clearing rejected Spartan token");
        self.persister.clear(SPARTAN_TOKEN_NAME).await?;
        Ok(self.cache.clear_token_if(matches))
    }
}

/// The assembled chain
///
/// Cheap to clone; clones share every cache.
#[derive(Clone)]
pub struct TokenChain {
    user: Option<Arc<XboxUserTokenLayer>>,
    xsts: Arc<dyn XstsTicketSource>,
    spartan: Arc<SpartanTokenLayer>,
}

impl TokenChain {
    /// Build the full chain on top of an access token provider
    pub fn new(
        config: AuthConfig,
        access: Arc<dyn AccessTokenProvider>,
        persister: Arc<dyn TokenPersister>,
    ) -> Result<Self> {
        let client = AuthClient::new(config)?;
        Ok(Self::with_client(client, access, persister))
    }

    pub fn with_client(
        client: AuthClient,
        access: Arc<dyn AccessTokenProvider>,
        persister: Arc<dyn TokenPersister>,
    ) -> Self {
        let user = Arc::new(XboxUserTokenLayer::new(
            client.clone(),
            access,
            Arc::clone(&persister),
        ));
        let xsts: Arc<dyn XstsTicketSource> = Arc::new(XstsTicketLayer::new(
            client.clone(),
            user.clone(),
            Arc::clone(&persister),
        ));
        let spartan = Arc::new(SpartanTokenLayer::new(client, Arc::clone(&xsts), persister));

        Self {
            user: Some(user),
            xsts,
            spartan,
        }
    }

    /// Build a chain whose XSTS tickets come from `xsts`, e.g. a [`StaticXstsTicket`]
    ///
    /// Such a chain has no user token layer.
    pub fn with_xsts_source(
        client: AuthClient,
        xsts: Arc<dyn XstsTicketSource>,
        persister: Arc<dyn TokenPersister>,
    ) -> Self {
        let spartan = Arc::new(SpartanTokenLayer::new(client, Arc::clone(&xsts), persister));
        Self {
            user: None,
            xsts,
            spartan,
        }
    }

    #[instrument(skip(self))]
    pub async fn spartan_token(&self) -> Result<SpartanToken> {
        self.spartan.spartan_token().await
    }

    #[instrument(skip(self))]
    pub async fn xsts_ticket(&self, relying_party: RelyingParty) -> Result<XboxTicket> {
        self.xsts.xsts_ticket(relying_party).await
    }

    /// `XBL3.0 x=<uhs>;<token>` for the Xbox Live relying party
    #[instrument(skip(self))]
    pub async fn xbox_live_v3_token(&self) -> Result<String> {
        self.xsts
            .xsts_ticket(RelyingParty::Xbox)
            .await?
            .xbox_live_v3_header()
    }

    pub async fn spartan_token_expiration(&self) -> Result<Option<DateTime<Utc>>> {
        self.spartan.current_expiration().await
    }

    #[instrument(skip(self))]
    pub async fn clear_spartan_token(&self) -> Result<()> {
        self.spartan.clear_spartan_token().await
    }

    #[instrument(skip(self))]
    pub async fn clear_xsts_ticket(&self, relying_party: RelyingParty) -> Result<()> {
        self.xsts.clear_xsts_ticket(relying_party).await
    }

    #[instrument(skip(self))]
    pub async fn clear_xbox_user_token(&self) -> Result<()> {
        match &self.user {
            Some(user) => user.clear_user_token().await,
            None => {
                debug!("Chain has no user token layer");
                Ok(())
            }
        }
    }

    pub async fn clear_xbox_live_v3_token(&self) -> Result<()> {
        self.clear_xsts_ticket(RelyingParty::Xbox).await
    }

    /// Clear the Spartan token only if the cache still holds `stale`
    #[instrument(skip_all)]
    pub async fn clear_spartan_token_if(&self, stale: &str) -> Result<bool> {
        self.spartan.clear_spartan_token_if(stale).await
    }

    /// Clear the XSTS ticket for `relying_party` only if it is still `stale`
    #[instrument(skip(self, stale))]
    pub async fn clear_xsts_ticket_if(&self, relying_party: RelyingParty, stale: &str) -> Result<bool> {
        self.xsts.clear_xsts_ticket_if(relying_party, stale).await
    }

    /// Clear the Xbox Live ticket behind a rejected `XBL3.0 x=<uhs>;<token>` value
    pub async fn clear_xbox_live_v3_token_if(&self, stale: &str) -> Result<bool> {
        let token = stale.rsplit_once(';').map_or(stale, |(_, token)| token);
        self.clear_xsts_ticket_if(RelyingParty::Xbox, token).await
    }
}

#[async_trait::async_trait]
impl SpartanTokenProvider for TokenChain {
    async fn spartan_token(&self) -> Result<SpartanToken> {
        TokenChain::spartan_token(self).await
    }

    async fn clear_spartan_token(&self) -> Result<()> {
        TokenChain::clear_spartan_token(self).await
    }

    async fn current_expiration(&self) -> Result<Option<DateTime<Utc>>> {
        self.spartan_token_expiration().await
    }

    async fn clear_spartan_token_if(&self, stale: &str) -> Result<bool> {
        TokenChain::clear_spartan_token_if(self, stale).await
    }
}

#[async_trait::async_trait]
impl XboxTokenProvider for TokenChain {
    async fn xbox_live_v3_token(&self) -> Result<String> {
        TokenChain::xbox_live_v3_token(self).await
    }

    async fn clear_xbox_live_v3_token(&self) -> Result<()> {
        TokenChain::clear_xbox_live_v3_token(self).await
    }

    async fn clear_xbox_live_v3_token_if(&self, stale: &str) -> Result<bool> {
        TokenChain::clear_xbox_live_v3_token_if(self, stale).await
    }
}
