//! In-memory firewall backend
//!
//! Used for dry runs, where rules are only logged, and by tests, which can
//! queue failures for upcoming commits or rule additions.

use super::{BackendError, FirewallBackend, RedirectRule};
use std::collections::VecDeque;
use tracing::info;

/// Firewall backend keeping its rules in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    active: Vec<RedirectRule>,
    staged: Option<Vec<RedirectRule>>,
    commit_failures: VecDeque<BackendError>,
    add_failures: VecDeque<BackendError>,
    commit_attempts: usize,
    rollbacks: usize,
}

impl MemoryBackend {
    /// Create a backend with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently committed rules
    pub fn rules(&self) -> &[RedirectRule] {
        &self.active
    }

    /// Whether a transaction is open
    pub fn in_transaction(&self) -> bool {
        self.staged.is_some()
    }

    /// Make an upcoming commit fail; failures are consumed in order
    pub fn fail_next_commit(&mut self, error: BackendError) {
        self.commit_failures.push_back(error);
    }

    /// Make an upcoming rule addition fail
    pub fn fail_next_add(&mut self, error: BackendError) {
        self.add_failures.push_back(error);
    }

    /// Number of commits attempted so far
    pub fn commit_attempts(&self) -> usize {
        self.commit_attempts
    }

    /// Number of rollbacks so far
    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }
}

impl FirewallBackend for MemoryBackend {
    fn reset(&mut self) -> Result<(), BackendError> {
        self.active.clear();
        self.staged = None;
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<(), BackendError> {
        self.staged = Some(Vec::new());
        Ok(())
    }

    fn add_redirect(&mut self, rule: &RedirectRule) -> Result<(), BackendError> {
        if let Some(error) = self.add_failures.pop_front() {
            return Err(error);
        }
        let staged = self
            .staged
            .as_mut()
            .ok_or_else(|| BackendError::Failed("no open transaction".to_string()))?;
        staged.push(*rule);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.commit_attempts += 1;
        if let Some(error) = self.commit_failures.pop_front() {
            return Err(error);
        }

        let staged = self
            .staged
            .take()
            .ok_or_else(|| BackendError::Failed("no open transaction".to_string()))?;
        for rule in &staged {
            info!("rdr {}", rule);
        }
        self.active = staged;
        Ok(())
    }

    fn rollback(&mut self) {
        self.rollbacks += 1;
        self.staged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Protocol;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn rule(port: u16) -> RedirectRule {
        RedirectRule {
            protocol: Protocol::Udp,
            external: SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 50000 + port),
            internal: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), port),
        }
    }

    #[test]
    fn test_rules_only_visible_after_commit() {
        let mut backend = MemoryBackend::new();
        backend.begin_transaction().unwrap();
        backend.add_redirect(&rule(1)).unwrap();
        assert!(backend.rules().is_empty());

        backend.commit().unwrap();
        assert_eq!(backend.rules(), &[rule(1)]);
        assert!(!backend.in_transaction());
    }

    #[test]
    fn test_add_outside_transaction_fails() {
        let mut backend = MemoryBackend::new();
        assert!(matches!(
            backend.add_redirect(&rule(1)),
            Err(BackendError::Failed(_))
        ));
    }

    #[test]
    fn test_busy_commit_keeps_staged_rules() {
        let mut backend = MemoryBackend::new();
        backend.fail_next_commit(BackendError::Busy);
        backend.begin_transaction().unwrap();
        backend.add_redirect(&rule(1)).unwrap();

        assert!(matches!(backend.commit(), Err(BackendError::Busy)));
        assert!(backend.in_transaction());
        backend.commit().unwrap();
        assert_eq!(backend.rules().len(), 1);
    }

    #[test]
    fn test_rollback_discards_staged_rules() {
        let mut backend = MemoryBackend::new();
        backend.begin_transaction().unwrap();
        backend.add_redirect(&rule(1)).unwrap();
        backend.rollback();

        assert!(!backend.in_transaction());
        assert!(backend.rules().is_empty());
        assert_eq!(backend.rollbacks(), 1);
    }

    #[test]
    fn test_reset_clears_active_rules() {
        let mut backend = MemoryBackend::new();
        backend.begin_transaction().unwrap();
        backend.add_redirect(&rule(1)).unwrap();
        backend.commit().unwrap();

        backend.reset().unwrap();
        assert!(backend.rules().is_empty());
    }
}
