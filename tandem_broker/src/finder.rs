//! Resolving the token that answers a Delegate's request

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use tandem_clock::{Clock, DurationSecs, System};
use tandem_sync::ExecOptions;
use tandem_tokens::{
    Credential, CredentialStore, IdToken, OAuth2ErrorResponse, RefreshCoalescer, RefreshError,
    RefreshOutcome, Scopes, StoreError, Token,
};
use thiserror::Error;
use tokio::time;

use crate::AuthParams;

/// How long to wait on another actor's refresh before giving up
pub const TOKEN_REQUEST_LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// The tag carried by credentials obtained on behalf of a Delegate
pub const DELEGATED_TAG: &str = "delegated";

/// Why no token could be found
#[derive(Debug, Error)]
pub enum FindTokenError {
    /// The user must sign in interactively
    #[error("interactive sign-in required")]
    InteractionRequired,
    /// The request named an issuer this Host does not serve
    #[error("issuer `{requested}` is not served here")]
    IssuerMismatch {
        /// The issuer requested
        requested: String,
    },
    /// The authority refused to issue a token
    #[error("authority rejected the request: {0}")]
    Rejected(OAuth2ErrorResponse),
    /// The authority could not be reached
    #[error("unable to refresh token")]
    Refresh(#[from] RefreshError),
    /// The credential store failed
    #[error("credential store failed")]
    Store(#[source] StoreError),
}

/// Finds tokens for a Host to hand out
///
/// This is the seam where an application decides which tokens Delegates
/// may have.
#[async_trait]
pub trait TokenFinder: Send + Sync {
    /// Finds a token satisfying `params`
    async fn find_token(&self, params: &AuthParams) -> Result<Token, FindTokenError>;

    /// Finds the identity token describing the current user
    async fn find_id_token(&self, params: &AuthParams) -> Result<Option<IdToken>, FindTokenError> {
        let token = self.find_token(params).await?;
        Ok(token.id_token().map(ToOwned::to_owned))
    }
}

#[async_trait]
impl<T: TokenFinder + ?Sized> TokenFinder for Arc<T> {
    async fn find_token(&self, params: &AuthParams) -> Result<Token, FindTokenError> {
        (**self).find_token(params).await
    }

    async fn find_id_token(&self, params: &AuthParams) -> Result<Option<IdToken>, FindTokenError> {
        (**self).find_id_token(params).await
    }
}

/// Finds tokens among the credentials of a [`CredentialStore`]
///
/// A request without scopes is answered with the default credential. A
/// request with scopes is answered with a delegated credential whose scopes
/// cover those requested, or else by narrowing the default credential
/// through a refresh. Refreshes go through a [`RefreshCoalescer`] and are
/// exclusive across actors when it is coordinated. If another actor holds
/// the refresh for longer than the lock timeout, the caller is told to sign
/// in interactively.
pub struct CredentialTokenFinder<C = System> {
    store: Arc<dyn CredentialStore>,
    coalescer: Arc<RefreshCoalescer>,
    lock_timeout: Duration,
    grace_period: DurationSecs,
    clock: C,
}

impl<C> std::fmt::Debug for CredentialTokenFinder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialTokenFinder")
            .field("coalescer", &self.coalescer)
            .field("lock_timeout", &self.lock_timeout)
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

impl CredentialTokenFinder<System> {
    /// Constructs a finder over `store`, refreshing through `coalescer`
    pub fn new(store: Arc<dyn CredentialStore>, coalescer: Arc<RefreshCoalescer>) -> Self {
        Self {
            store,
            coalescer,
            lock_timeout: TOKEN_REQUEST_LOCK_TIMEOUT,
            grace_period: DurationSecs(30),
            clock: System,
        }
    }
}

impl<C> CredentialTokenFinder<C> {
    /// Sets how long to wait on another actor's refresh
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Sets how long a token must remain valid to be handed out
    pub fn with_grace_period(mut self, grace_period: DurationSecs) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Judges token freshness with a different clock
    pub fn with_clock<D>(self, clock: D) -> CredentialTokenFinder<D> {
        CredentialTokenFinder {
            store: self.store,
            coalescer: self.coalescer,
            lock_timeout: self.lock_timeout,
            grace_period: self.grace_period,
            clock,
        }
    }
}

impl<C: Clock + Send + Sync> CredentialTokenFinder<C> {
    async fn default_credential(&self) -> Result<Credential, FindTokenError> {
        self.store
            .get_default()
            .await
            .map_err(FindTokenError::Store)?
            .ok_or(FindTokenError::InteractionRequired)
    }

    async fn refresh(
        &self,
        credential: &Credential,
        scopes: Option<&Scopes>,
    ) -> Result<Token, FindTokenError> {
        // Retries share the one deadline, so the total wait never exceeds it.
        let options = ExecOptions::default().with_timeout(self.lock_timeout);
        let refresh =
            self.coalescer
                .refresh_exclusive(credential.id(), credential.token(), scopes, options);
        let Ok(outcome) = time::timeout(self.lock_timeout, refresh).await else {
            tracing::warn!(
                credential_id = %credential.id(),
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "timed out waiting on another context's refresh"
            );
            return Err(FindTokenError::InteractionRequired);
        };

        match outcome {
            Ok(RefreshOutcome::Refreshed(token)) => Ok(token),
            Ok(RefreshOutcome::Rejected(error)) => Err(FindTokenError::Rejected(error)),
            Err(RefreshError::LockUnavailable { name }) => {
                tracing::warn!(
                    credential_id = %credential.id(),
                    lock = %name,
                    "gave up waiting on another context's refresh"
                );
                Err(FindTokenError::InteractionRequired)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn find_default(&self, default: Credential) -> Result<Token, FindTokenError> {
        if default
            .token()
            .will_be_valid_in_with_clock(self.grace_period, &self.clock)
        {
            return Ok(default.token().clone());
        }

        let token = self.refresh(&default, None).await?;

        let replacement = self
            .store
            .store(token.clone(), default.tags().clone())
            .await
            .map_err(FindTokenError::Store)?;
        self.store
            .set_default(replacement.id())
            .await
            .map_err(FindTokenError::Store)?;
        self.store
            .remove(default.id())
            .await
            .map_err(FindTokenError::Store)?;

        tracing::info!(
            credential_id = %replacement.id(),
            replaced = %default.id(),
            "refreshed default credential"
        );
        Ok(token)
    }

    async fn find_delegated(
        &self,
        default: Credential,
        params: &AuthParams,
    ) -> Result<Token, FindTokenError> {
        let requested = &params.scopes;
        let client_tag = params.client_id.as_ref().map(|c| format!("client:{c}"));

        let cached = self
            .store
            .find(&|c: &Credential| {
                c.has_tag(DELEGATED_TAG)
                    && client_tag.as_deref().map_or(true, |t| c.has_tag(t))
                    && c.token().scopes().is_superset(requested)
                    && c
                        .token()
                        .will_be_valid_in_with_clock(self.grace_period, &self.clock)
            })
            .await
            .map_err(FindTokenError::Store)?
            .into_iter()
            .max_by_key(|c| c.token().expiry());

        if let Some(credential) = cached {
            tracing::debug!(credential_id = %credential.id(), "reusing delegated credential");
            return Ok(credential.token().clone());
        }

        tracing::debug!(
            credential_id = %default.id(),
            scopes = %requested.to_space_delimited(),
            "narrowing default credential"
        );
        let token = self.refresh(&default, Some(requested)).await?;

        let tags: BTreeSet<String> = [Some(DELEGATED_TAG.to_owned()), client_tag]
            .into_iter()
            .flatten()
            .collect();
        self.store
            .store(token.clone(), tags)
            .await
            .map_err(FindTokenError::Store)?;

        self.prune_expired().await?;
        Ok(token)
    }

    async fn prune_expired(&self) -> Result<(), FindTokenError> {
        let expired = self
            .store
            .find(&|c: &Credential| {
                c.has_tag(DELEGATED_TAG) && c.token().is_expired_with_clock(&self.clock)
            })
            .await
            .map_err(FindTokenError::Store)?;

        for credential in expired {
            tracing::trace!(credential_id = %credential.id(), "pruning expired delegated credential");
            self.store
                .remove(credential.id())
                .await
                .map_err(FindTokenError::Store)?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenFinder for CredentialTokenFinder<C> {
    async fn find_token(&self, params: &AuthParams) -> Result<Token, FindTokenError> {
        let default = self.default_credential().await?;

        if params.scopes.is_empty() {
            self.find_default(default).await
        } else {
            self.find_delegated(default, params).await
        }
    }

    async fn find_id_token(&self, _params: &AuthParams) -> Result<Option<IdToken>, FindTokenError> {
        let default = self.default_credential().await?;
        Ok(default.token().id_token().map(ToOwned::to_owned))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tandem_clock::{TestClock, UnixTime};
    use tandem_sync::{LocalNamespace, NamedLock, SynchronizedResult};
    use tandem_tokens::{InMemoryCredentialStore, OAuth2Client};

    use super::*;

    #[derive(Debug)]
    struct Authority {
        clock: TestClock,
        calls: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl OAuth2Client for Authority {
        async fn perform_refresh(
            &self,
            token: &Token,
            scopes: Option<&Scopes>,
        ) -> Result<RefreshOutcome, RefreshError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Ok(RefreshOutcome::Rejected(OAuth2ErrorResponse::new(
                    "invalid_scope",
                )));
            }
            Ok(RefreshOutcome::Refreshed(
                Token::builder(format!("access-{n}"), DurationSecs(300))
                    .refresh_token("refresh")
                    .scopes(scopes.cloned().unwrap_or_else(|| token.scopes().clone()))
                    .build_with_clock(&self.clock),
            ))
        }
    }

    struct Fixture {
        clock: TestClock,
        authority: Arc<Authority>,
        store: Arc<InMemoryCredentialStore>,
        finder: CredentialTokenFinder<TestClock>,
    }

    impl Fixture {
        async fn new(reject: bool) -> Self {
            Self::with_coalescer(reject, |authority| RefreshCoalescer::from_arc(authority)).await
        }

        async fn with_coalescer(
            reject: bool,
            coalescer: impl FnOnce(Arc<Authority>) -> RefreshCoalescer,
        ) -> Self {
            let clock = TestClock::new(UnixTime(10_000));
            let authority = Arc::new(Authority {
                clock: clock.clone(),
                calls: AtomicUsize::new(0),
                reject,
            });
            let store = Arc::new(InMemoryCredentialStore::new());
            store
                .store(
                    Token::builder("primary", DurationSecs(3600))
                        .refresh_token("refresh")
                        .id_token("e30.eyJzdWIiOiJ1c2VyLTEifQ.c2ln")
                        .scopes(Scopes::from_space_delimited("openid profile read write"))
                        .build_with_clock(&clock),
                    BTreeSet::new(),
                )
                .await
                .unwrap();

            let finder = CredentialTokenFinder::new(
                store.clone(),
                Arc::new(coalescer(authority.clone())),
            )
            .with_clock(clock.clone());

            Self {
                clock,
                authority,
                store,
                finder,
            }
        }

        fn calls(&self) -> usize {
            self.authority.calls.load(Ordering::SeqCst)
        }
    }

    fn scoped(scopes: &str) -> AuthParams {
        AuthParams {
            client_id: Some("widget".into()),
            scopes: Scopes::from_space_delimited(scopes),
            ..AuthParams::default()
        }
    }

    #[tokio::test]
    async fn without_default_credential_interaction_is_required() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let coalescer = Arc::new(RefreshCoalescer::new(Authority {
            clock: TestClock::default(),
            calls: AtomicUsize::new(0),
            reject: false,
        }));
        let finder = CredentialTokenFinder::new(store, coalescer);

        let err = finder.find_token(&AuthParams::default()).await.unwrap_err();

        assert!(matches!(err, FindTokenError::InteractionRequired));
    }

    mod when_no_scopes_are_requested {
        use super::*;

        #[tokio::test]
        async fn fresh_default_is_returned_as_is() {
            let fixture = Fixture::new(false).await;

            let token = fixture.finder.find_token(&AuthParams::default()).await.unwrap();

            assert_eq!(token.access_token().as_str(), "primary");
            assert_eq!(fixture.calls(), 0);
        }

        #[tokio::test]
        async fn stale_default_is_refreshed_and_replaced() {
            let fixture = Fixture::new(false).await;
            fixture.clock.advance(DurationSecs(3590));

            let token = fixture.finder.find_token(&AuthParams::default()).await.unwrap();

            assert_eq!(fixture.calls(), 1);
            let default = fixture.store.get_default().await.unwrap().unwrap();
            assert_eq!(default.token(), &token);
            assert_eq!(fixture.store.find(&|_: &Credential| true).await.unwrap().len(), 1);
        }
    }

    mod when_scopes_are_requested {
        use super::*;

        #[tokio::test]
        async fn default_is_narrowed_once_then_reused() {
            let fixture = Fixture::new(false).await;

            let first = fixture.finder.find_token(&scoped("read")).await.unwrap();
            let second = fixture.finder.find_token(&scoped("read")).await.unwrap();

            assert_eq!(first, second);
            assert_eq!(first.scopes(), &Scopes::from_space_delimited("read"));
            assert_eq!(fixture.calls(), 1);
        }

        #[tokio::test]
        async fn a_broader_delegated_token_satisfies_narrower_requests() {
            let fixture = Fixture::new(false).await;

            let broad = fixture.finder.find_token(&scoped("read write")).await.unwrap();
            let narrow = fixture.finder.find_token(&scoped("write")).await.unwrap();

            assert_eq!(broad, narrow);
            assert_eq!(fixture.calls(), 1);
        }

        #[tokio::test]
        async fn delegated_tokens_are_not_shared_between_clients() {
            let fixture = Fixture::new(false).await;
            let other_client = AuthParams {
                client_id: Some("other".into()),
                ..scoped("read")
            };

            fixture.finder.find_token(&scoped("read")).await.unwrap();
            fixture.finder.find_token(&other_client).await.unwrap();

            assert_eq!(fixture.calls(), 2);
        }

        #[tokio::test]
        async fn delegated_token_inside_grace_period_is_replaced() {
            let fixture = Fixture::new(false).await;

            let first = fixture.finder.find_token(&scoped("read")).await.unwrap();
            fixture.clock.advance(DurationSecs(280));
            let second = fixture.finder.find_token(&scoped("read")).await.unwrap();

            assert_ne!(first, second);
            assert_eq!(fixture.calls(), 2);
        }

        #[tokio::test]
        async fn rejection_is_reported() {
            let fixture = Fixture::new(true).await;

            let err = fixture.finder.find_token(&scoped("admin")).await.unwrap_err();

            assert!(matches!(err, FindTokenError::Rejected(e) if e.error == "invalid_scope"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_held_elsewhere_past_the_lock_timeout_requires_interaction() {
        let namespace = LocalNamespace::new();
        let actor = namespace.actor("https://host.example");
        let fixture = Fixture::with_coalescer(false, |authority| {
            RefreshCoalescer::from_arc(authority)
                .with_coordinator(SynchronizedResult::new(actor.clone(), actor.clone()))
        })
        .await;
        let Fixture {
            authority,
            store,
            finder,
            ..
        } = fixture;
        let finder = finder.with_lock_timeout(Duration::from_secs(1));
        let default = store.get_default().await.unwrap().unwrap();

        let stuck = namespace.actor("https://stuck.example");
        let _guard = stuck
            .try_acquire(&format!("refresh:{}:read", default.id()))
            .expect("lock is free");

        let started = time::Instant::now();
        let err = finder.find_token(&scoped("read")).await.unwrap_err();

        assert!(matches!(err, FindTokenError::InteractionRequired));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_lock_timeout_bounds_the_whole_wait() {
        let namespace = LocalNamespace::new();
        let actor = namespace.actor("https://host.example");
        let fixture = Fixture::with_coalescer(false, |authority| {
            RefreshCoalescer::from_arc(authority)
                .with_coordinator(SynchronizedResult::new(actor.clone(), actor.clone()))
        })
        .await;
        let default = fixture.store.get_default().await.unwrap().unwrap();

        let stuck = namespace.actor("https://stuck.example");
        let _guard = stuck
            .try_acquire(&format!("refresh:{}:read", default.id()))
            .expect("lock is free");

        let started = time::Instant::now();
        let err = fixture.finder.find_token(&scoped("read")).await.unwrap_err();

        assert!(matches!(err, FindTokenError::InteractionRequired));
        assert_eq!(started.elapsed(), TOKEN_REQUEST_LOCK_TIMEOUT);
    }

    #[tokio::test]
    async fn id_token_comes_from_the_default_credential() {
        let fixture = Fixture::new(false).await;

        let id_token = fixture
            .finder
            .find_id_token(&scoped("read"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(id_token.claims().unwrap()["sub"], "user-1");
        assert_eq!(fixture.calls(), 0);
    }
}
