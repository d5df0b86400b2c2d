//! Subscription Registry
//!
//! In-memory record of which downstream clients want which instruments,
//! plus the set of instruments already requested from the upstream feed
//! (the dedup set).
//!
//! # Design
//!
//! The registry tracks two independent things:
//! - Interest: instrument → set of client ids. Sets are deleted as soon as
//!   they become empty, so a disconnected client leaves nothing behind.
//! - Dedup set: instruments requested upstream. Never shrunk while the
//!   process lives; replayed in full after every upstream reconnect.
//!
//! Both live behind one lock so that a subscribe request can record
//! interest and claim its not-yet-requested instruments in a single step.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::streaming::InstrumentKey;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream client connection.
pub type ClientId = u64;

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    /// Instrument → clients interested in it.
    interest: HashMap<InstrumentKey, HashSet<ClientId>>,
    /// Instruments already requested upstream.
    upstream: HashSet<InstrumentKey>,
}

impl RegistryState {
    fn add_interest(&mut self, key: &InstrumentKey, client: ClientId) -> bool {
        let is_new = !self.interest.contains_key(key);
        self.interest.entry(key.clone()).or_default().insert(client);
        is_new
    }

    /// Drop the client from every interest set.
    ///
    /// Returns instruments that no longer have any interested client.
    fn remove_client(&mut self, client: ClientId) -> Vec<InstrumentKey> {
        let mut emptied = Vec::new();

        self.interest.retain(|key, clients| {
            clients.remove(&client);
            if clients.is_empty() {
                emptied.push(key.clone());
                false
            } else {
                true
            }
        });

        emptied
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe subscription registry shared by the feed client and the
/// client manager.
///
/// # Example
///
/// ```rust
/// use dhan_stream_proxy::domain::streaming::{ExchangeSegment, InstrumentKey};
/// use dhan_stream_proxy::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::new();
/// let key = InstrumentKey::new(ExchangeSegment::BSE_EQ, "500325");
///
/// // First client: the instrument must be requested upstream.
/// let fresh = registry.plan_subscription(1, &[key.clone()]);
/// assert_eq!(fresh, vec![key.clone()]);
///
/// // Second client: already requested, nothing to send.
/// let fresh = registry.plan_subscription(2, &[key.clone()]);
/// assert!(fresh.is_empty());
///
/// // Both gone: interest is cleared, the dedup set is kept for replay.
/// registry.remove_client(1);
/// registry.remove_client(2);
/// assert!(registry.interested_clients(&key).is_empty());
/// assert!(!registry.needs_upstream_subscribe(&key));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `client` wants `key`.
    ///
    /// Returns `true` if this is the first interest recorded for `key`.
    /// Whether an upstream subscribe is still required is decided by
    /// [`Self::needs_upstream_subscribe`], not by this return value.
    pub fn add_interest(&self, key: &InstrumentKey, client: ClientId) -> bool {
        self.state.write().add_interest(key, client)
    }

    /// True iff `key` has not been requested upstream yet.
    #[must_use]
    pub fn needs_upstream_subscribe(&self, key: &InstrumentKey) -> bool {
        !self.state.read().upstream.contains(key)
    }

    /// Add every key to the dedup set.
    pub fn mark_upstream_subscribed<I>(&self, keys: I)
    where
        I: IntoIterator<Item = InstrumentKey>,
    {
        self.state.write().upstream.extend(keys);
    }

    /// Record interest for every key and claim the ones not yet requested
    /// upstream, under a single write lock.
    ///
    /// The returned keys are already in the dedup set; the caller is
    /// expected to send exactly these in one subscribe request. Duplicate
    /// keys in `keys` are claimed once.
    pub fn plan_subscription(&self, client: ClientId, keys: &[InstrumentKey]) -> Vec<InstrumentKey> {
        let mut state = self.state.write();
        let mut fresh = Vec::new();

        for key in keys {
            state.add_interest(key, client);
            if state.upstream.insert(key.clone()) {
                fresh.push(key.clone());
            }
        }

        fresh
    }

    /// Remove `client` from every interest set, deleting sets that become
    /// empty. The dedup set is left untouched.
    ///
    /// Returns instruments that lost their last interested client.
    pub fn remove_client(&self, client: ClientId) -> Vec<InstrumentKey> {
        self.state.write().remove_client(client)
    }

    /// Every instrument requested upstream, sorted for stable replay.
    #[must_use]
    pub fn all_dedup_keys(&self) -> Vec<InstrumentKey> {
        let mut keys: Vec<_> = self.state.read().upstream.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Clients currently interested in `key`.
    #[must_use]
    pub fn interested_clients(&self, key: &InstrumentKey) -> Vec<ClientId> {
        self.state
            .read()
            .interest
            .get(key)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any interest set exists for `key`.
    #[must_use]
    pub fn has_interest(&self, key: &InstrumentKey) -> bool {
        self.state.read().interest.contains_key(key)
    }

    /// Current registry sizes.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        let clients: HashSet<ClientId> = state.interest.values().flatten().copied().collect();

        RegistryStats {
            instruments_with_interest: state.interest.len(),
            interested_clients: clients.len(),
            upstream_subscriptions: state.upstream.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of registry sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Instruments with at least one interested client.
    pub instruments_with_interest: usize,
    /// Distinct clients with at least one interest.
    pub interested_clients: usize,
    /// Size of the dedup set.
    pub upstream_subscriptions: usize,
}

// =============================================================================
// Tests
// =============================================================================
