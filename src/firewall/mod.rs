//! Firewall rule synchronisation
//!
//! The firewall holds one redirect rule per mapping. Rather than patching
//! rules one at a time, every change regenerates the complete rule set inside
//! a single backend transaction, so the firewall either matches the mapping
//! store or keeps its previous rules.
//!
//! Backends:
//! - [`nft::NftBackend`] - nftables, applied atomically with `nft -f -`
//! - [`memory::MemoryBackend`] - keeps rules in memory (dry run and tests)

pub mod memory;
pub mod nft;

use crate::mapping::{Mapping, Protocol};
use std::fmt;
use std::net::SocketAddrV4;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Pause before retrying a commit the backend reported as busy
pub const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(5);

/// A single inbound redirection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RedirectRule {
    /// Transport protocol
    pub protocol: Protocol,
    /// Destination matched on arriving packets
    pub external: SocketAddrV4,
    /// Destination packets are rewritten to
    pub internal: SocketAddrV4,
}

impl From<&Mapping> for RedirectRule {
    fn from(mapping: &Mapping) -> Self {
        Self {
            protocol: mapping.protocol,
            external: mapping.external,
            internal: mapping.internal,
        }
    }
}

impl fmt::Display for RedirectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.external, self.internal)
    }
}

/// Errors reported by a firewall backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The rule tables are locked by someone else, worth one retry
    #[error("firewall busy")]
    Busy,

    /// Any other refusal
    #[error("firewall error: {0}")]
    Failed(String),

    /// Failure talking to the firewall
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Atomic transaction interface to the packet filter
pub trait FirewallBackend {
    /// Remove every rule owned by the daemon, outside any transaction
    fn reset(&mut self) -> Result<(), BackendError>;

    /// Start staging a new rule set
    fn begin_transaction(&mut self) -> Result<(), BackendError>;

    /// Add a redirect to the staged rule set
    fn add_redirect(&mut self, rule: &RedirectRule) -> Result<(), BackendError>;

    /// Replace the active rules with the staged set
    ///
    /// A [`BackendError::Busy`] failure leaves the staged set in place so the
    /// commit can be attempted again.
    fn commit(&mut self) -> Result<(), BackendError>;

    /// Discard the staged rule set
    fn rollback(&mut self);
}

impl<B: FirewallBackend + ?Sized> FirewallBackend for Box<B> {
    fn reset(&mut self) -> Result<(), BackendError> {
        (**self).reset()
    }

    fn begin_transaction(&mut self) -> Result<(), BackendError> {
        (**self).begin_transaction()
    }

    fn add_redirect(&mut self, rule: &RedirectRule) -> Result<(), BackendError> {
        (**self).add_redirect(rule)
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        (**self).commit()
    }

    fn rollback(&mut self) {
        (**self).rollback()
    }
}

/// Errors from a rule set rebuild
#[derive(Debug, Error)]
pub enum SyncError {
    /// Clearing the daemon's rules failed
    #[error("unable to reset ruleset: {0}")]
    Reset(#[source] BackendError),

    /// The transaction could not be opened
    #[error("unable to start transaction: {0}")]
    Begin(#[source] BackendError),

    /// A rule was refused
    #[error("unable to add rule {rule}: {source}")]
    AddRule {
        /// Rule being added
        rule: RedirectRule,
        /// Backend failure
        #[source]
        source: BackendError,
    },

    /// The transaction could not be committed
    #[error("unable to commit ruleset: {0}")]
    Commit(#[source] BackendError),
}

/// Regenerates the firewall rules from the mapping store
pub struct RuleSynchronizer<B> {
    backend: B,
    retry_delay: Duration,
}

impl<B: FirewallBackend> RuleSynchronizer<B> {
    /// Wrap a backend
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            retry_delay: COMMIT_RETRY_DELAY,
        }
    }

    /// Override the pause between a busy commit and its retry
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Clear any rules left behind by a previous run
    pub fn reset(&mut self) -> Result<(), SyncError> {
        self.backend.reset().map_err(SyncError::Reset)
    }

    /// Replace the firewall rules with one redirect per mapping
    ///
    /// A busy commit is retried once after a short pause, blocking the caller.
    /// Any other failure rolls the transaction back; the previously committed
    /// rules stay active. Returns the number of rules committed.
    pub fn rebuild<'a, I>(&mut self, mappings: I) -> Result<usize, SyncError>
    where
        I: IntoIterator<Item = &'a Mapping>,
    {
        self.backend.begin_transaction().map_err(SyncError::Begin)?;

        let mut count = 0;
        for mapping in mappings {
            let rule = RedirectRule::from(mapping);
            if let Err(source) = self.backend.add_redirect(&rule) {
                self.backend.rollback();
                return Err(SyncError::AddRule { rule, source });
            }
            count += 1;
        }

        match self.backend.commit() {
            Ok(()) => {}
            Err(BackendError::Busy) => {
                debug!("Firewall busy, retrying commit in {:?}", self.retry_delay);
                std::thread::sleep(self.retry_delay);
                if let Err(e) = self.backend.commit() {
                    warn!("Commit retry failed: {}", e);
                    self.backend.rollback();
                    return Err(SyncError::Commit(e));
                }
            }
            Err(e) => {
                self.backend.rollback();
                return Err(SyncError::Commit(e));
            }
        }

        debug!("Committed {} redirect rules", count);
        Ok(count)
    }

    /// The wrapped backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The wrapped backend, mutably
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
