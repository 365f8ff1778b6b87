//! Credentials and the store that owns them

use std::{
    collections::{BTreeSet, HashMap},
    error, fmt,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{Token, TokenId, TokenIdRef};

/// A token held by a credential store, with its bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    token: Token,
    tags: BTreeSet<String>,
    is_default: bool,
}

impl Credential {
    /// Wraps a token with tags
    pub fn new<I, S>(token: Token, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            token,
            tags: tags.into_iter().map(Into::into).collect(),
            is_default: false,
        }
    }

    /// The credential's identifier, shared with its token
    #[inline]
    pub fn id(&self) -> &TokenIdRef {
        self.token.id()
    }

    /// The held token
    #[inline]
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// The credential's tags
    #[inline]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Whether the credential carries `tag`
    #[inline]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Whether this is the store's default credential
    #[inline]
    pub fn is_default(&self) -> bool {
        self.is_default
    }
}

/// A change to the contents of a credential store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialEvent {
    /// A credential was stored
    Added(TokenId),
    /// A credential was removed
    Removed(TokenId),
    /// A different credential became the default, or none did
    DefaultChanged(Option<TokenId>),
    /// Every credential was removed
    StorageCleared,
}

/// The error type returned by credential stores
pub type StoreError = Box<dyn error::Error + Send + Sync + 'static>;

/// A store of credentials local to one actor
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Finds every credential matching `predicate`
    async fn find(
        &self,
        predicate: &(dyn for<'c> Fn(&'c Credential) -> bool + Send + Sync),
    ) -> Result<Vec<Credential>, StoreError>;

    /// Gets the default credential, if any
    async fn get_default(&self) -> Result<Option<Credential>, StoreError>;

    /// Stores a token with the given tags
    async fn store(&self, token: Token, tags: BTreeSet<String>) -> Result<Credential, StoreError>;

    /// Removes a credential
    async fn remove(&self, id: &TokenIdRef) -> Result<Option<Credential>, StoreError>;

    /// Makes the credential `id` the default
    async fn set_default(&self, id: &TokenIdRef) -> Result<(), StoreError>;

    /// Removes every credential
    async fn clear(&self) -> Result<(), StoreError>;

    /// Subscribes to changes to the store
    fn events(&self) -> broadcast::Receiver<CredentialEvent>;
}

/// The credential store could not find the credential requested
#[derive(Debug, thiserror::Error)]
#[error("no credential with id {0}")]
pub struct UnknownCredential(pub TokenId);

/// A credential store kept in memory
pub struct InMemoryCredentialStore {
    credentials: Mutex<HashMap<TokenId, Credential>>,
    events: broadcast::Sender<CredentialEvent>,
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credentials = self.credentials.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryCredentialStore")
            .field("credentials", &credentials.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InMemoryCredentialStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            credentials: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn emit(&self, event: CredentialEvent) {
        tracing::trace!(?event, "credential store event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn credentials(&self) -> std::sync::MutexGuard<'_, HashMap<TokenId, Credential>> {
        self.credentials.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find(
        &self,
        predicate: &(dyn for<'c> Fn(&'c Credential) -> bool + Send + Sync),
    ) -> Result<Vec<Credential>, StoreError> {
        let credentials = self.credentials();
        Ok(credentials
            .values()
            .filter(|c| predicate(c))
            .cloned()
            .collect())
    }

    async fn get_default(&self) -> Result<Option<Credential>, StoreError> {
        Ok(self.credentials().values().find(|c| c.is_default).cloned())
    }

    async fn store(&self, token: Token, tags: BTreeSet<String>) -> Result<Credential, StoreError> {
        let id = token.id().to_owned();
        let credential = {
            let mut credentials = self.credentials();
            let is_default = credentials.is_empty();
            let credential = Credential {
                token,
                tags,
                is_default,
            };
            credentials.insert(id.clone(), credential.clone());
            credential
        };

        self.emit(CredentialEvent::Added(id.clone()));
        if credential.is_default {
            self.emit(CredentialEvent::DefaultChanged(Some(id)));
        }
        Ok(credential)
    }

    async fn remove(&self, id: &TokenIdRef) -> Result<Option<Credential>, StoreError> {
        let removed = self.credentials().remove(id);
        if let Some(credential) = &removed {
            self.emit(CredentialEvent::Removed(id.to_owned()));
            if credential.is_default {
                self.emit(CredentialEvent::DefaultChanged(None));
            }
        }
        Ok(removed)
    }

    async fn set_default(&self, id: &TokenIdRef) -> Result<(), StoreError> {
        {
            let mut credentials = self.credentials();
            if !credentials.contains_key(id) {
                return Err(UnknownCredential(id.to_owned()).into());
            }
            for (key, credential) in credentials.iter_mut() {
                credential.is_default = <TokenId as AsRef<TokenIdRef>>::as_ref(key) == id;
            }
        }

        self.emit(CredentialEvent::DefaultChanged(Some(id.to_owned())));
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.credentials().clear();
        self.emit(CredentialEvent::StorageCleared);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<CredentialEvent> {
        self.events.subscribe()
    }
}
