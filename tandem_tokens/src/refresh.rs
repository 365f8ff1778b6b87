//! Coalescing of token refreshes within and across actors

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tandem_sync::{ExecOptions, SingleFlight, SyncError, SynchronizedResult};

use crate::{
    OAuth2Client, RefreshError, RefreshOutcome, RefreshToken, Scopes, Token, TokenIdRef,
};

impl From<SyncError> for RefreshError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::LockUnavailable { name } => Self::LockUnavailable { name },
            SyncError::TaskFailed { message } => Self::Coordination { message },
            SyncError::Serialization(e) => Self::Coordination {
                message: e.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RefreshKey {
    refresh_token: RefreshToken,
    scopes: Option<Scopes>,
}

/// Wraps an [`OAuth2Client`] so that identical refreshes run once
///
/// Concurrent calls for the same refresh token and requested scopes share a
/// single call to the authority. Calls to the authority from one coalescer
/// are issued one at a time in arrival order. Outcomes, including
/// rejections, are handed to every waiting caller but never cached.
pub struct RefreshCoalescer {
    client: Arc<dyn OAuth2Client>,
    flights: SingleFlight<RefreshKey, Result<RefreshOutcome, RefreshError>>,
    queue: tokio::sync::Mutex<()>,
    coordinator: Option<SynchronizedResult>,
}

impl fmt::Debug for RefreshCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoalescer")
            .field("inflight", &self.flights.inflight())
            .field("coordinated", &self.coordinator.is_some())
            .finish()
    }
}

impl RefreshCoalescer {
    /// Constructs a coalescer around `client`
    pub fn new<O: OAuth2Client + 'static>(client: O) -> Self {
        Self::from_arc(Arc::new(client))
    }

    /// Constructs a coalescer around a shared client
    pub fn from_arc(client: Arc<dyn OAuth2Client>) -> Self {
        Self {
            client,
            flights: SingleFlight::new(),
            queue: tokio::sync::Mutex::new(()),
            coordinator: None,
        }
    }

    /// Coordinates exclusive refreshes with other actors
    pub fn with_coordinator(mut self, coordinator: SynchronizedResult) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// The underlying client
    pub fn client(&self) -> &Arc<dyn OAuth2Client> {
        &self.client
    }

    /// The number of distinct refreshes currently in flight
    pub fn inflight(&self) -> usize {
        self.flights.inflight()
    }

    /// Refreshes `token`, optionally narrowing to `scopes`
    ///
    /// Joins an identical refresh already in flight in this actor.
    pub async fn refresh(
        &self,
        token: &Token,
        scopes: Option<&Scopes>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let refresh_token = token
            .refresh_token()
            .ok_or(RefreshError::MissingRefreshToken)?;

        let key = RefreshKey {
            refresh_token: refresh_token.to_owned(),
            scopes: scopes.cloned(),
        };

        self.flights
            .run(key, || async {
                let _turn = self.queue.lock().await;
                tracing::debug!(token.id = %token.id(), "refreshing token");
                self.client.perform_refresh(token, scopes).await
            })
            .await
    }

    /// Refreshes `token` at most once across every coordinated actor
    ///
    /// The refresh is named by `credential_id` and the requested scopes. An
    /// actor that loses the race waits for the winner's outcome instead of
    /// calling the authority itself. Without a coordinator this is the same
    /// as [`refresh`](Self::refresh).
    pub async fn refresh_exclusive(
        &self,
        credential_id: &TokenIdRef,
        token: &Token,
        scopes: Option<&Scopes>,
        options: ExecOptions,
    ) -> Result<RefreshOutcome, RefreshError> {
        let Some(coordinator) = &self.coordinator else {
            tracing::trace!("no coordinator configured, refreshing locally");
            return self.refresh(token, scopes).await;
        };

        let name = match scopes {
            Some(scopes) => format!("refresh:{credential_id}:{}", scopes.to_space_delimited()),
            None => format!("refresh:{credential_id}"),
        };

        // The winner keeps its own error; only losers see the broadcast text.
        let local_failure = Mutex::new(None);
        let failure = &local_failure;
        let outcome = coordinator
            .exec(
                &name,
                move || async move {
                    let outcome = self.refresh(token, scopes).await;
                    if let Err(error) = &outcome {
                        *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
                    }
                    outcome
                },
                options,
            )
            .await;

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let local = local_failure
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner);
                match (error, local) {
                    (SyncError::TaskFailed { .. }, Some(local)) => Err(local),
                    (error, _) => Err(error.into()),
                }
            }
        }
    }
}
