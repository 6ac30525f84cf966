//! Subscription Index
//!
//! Tracks which symbol each client connection is watching.
//!
//! # Design
//!
//! The index keeps two maps in step:
//! - connection → symbol (a connection watches at most one symbol)
//! - symbol → set of connections (used for fan-out)
//!
//! Symbol keys are stored exactly as the client sent them. Alias expansion
//! (`005930` vs `005930.KS`) is the fan-out's job, not the index's.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a client connection.
pub type ConnectionId = u64;

/// A symbol key as the client spelled it.
pub type Symbol = String;

// =============================================================================
// Index State
// =============================================================================

#[derive(Debug, Default)]
struct IndexState {
    by_connection: HashMap<ConnectionId, Symbol>,
    by_symbol: HashMap<Symbol, HashSet<ConnectionId>>,
}

impl IndexState {
    /// Detach a connection from whatever symbol it watches.
    fn detach(&mut self, connection: ConnectionId) -> Option<Symbol> {
        let symbol = self.by_connection.remove(&connection)?;
        if let Some(set) = self.by_symbol.get_mut(&symbol) {
            set.remove(&connection);
            if set.is_empty() {
                self.by_symbol.remove(&symbol);
            }
        }
        Some(symbol)
    }
}

// =============================================================================
// Subscription Index
// =============================================================================

/// Thread-safe bidirectional subscription index.
///
/// # Example
///
/// ```rust
/// use tick_gateway::domain::subscription::SubscriptionIndex;
///
/// let index = SubscriptionIndex::new();
///
/// assert_eq!(index.subscribe(1, "005930"), None);
/// assert_eq!(index.subscribe(1, "AAPL").as_deref(), Some("005930"));
///
/// assert!(index.subscribers("005930").is_empty());
/// assert_eq!(index.subscribers("AAPL"), vec![1]);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    state: RwLock<IndexState>,
}

impl SubscriptionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point a connection at `symbol`, replacing any previous subscription.
    ///
    /// Returns the symbol the connection watched before, if it differs.
    pub fn subscribe(&self, connection: ConnectionId, symbol: &str) -> Option<Symbol> {
        let mut state = self.state.write();

        if state.by_connection.get(&connection).map(String::as_str) == Some(symbol) {
            return None;
        }

        let previous = state.detach(connection);
        state.by_connection.insert(connection, symbol.to_string());
        state
            .by_symbol
            .entry(symbol.to_string())
            .or_default()
            .insert(connection);

        previous
    }

    /// Remove the connection's subscription if it is currently `symbol`.
    ///
    /// Returns `true` when an entry was removed.
    pub fn unsubscribe(&self, connection: ConnectionId, symbol: &str) -> bool {
        let mut state = self.state.write();
        if state.by_connection.get(&connection).map(String::as_str) != Some(symbol) {
            return false;
        }
        state.detach(connection).is_some()
    }

    /// Drop every trace of a connection, returning the symbol it watched.
    pub fn remove_connection(&self, connection: ConnectionId) -> Option<Symbol> {
        self.state.write().detach(connection)
    }

    /// Connections currently subscribed to exactly `symbol`.
    #[must_use]
    pub fn subscribers(&self, symbol: &str) -> Vec<ConnectionId> {
        self.state
            .read()
            .by_symbol
            .get(symbol)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The symbol a connection is watching.
    #[must_use]
    pub fn symbol_of(&self, connection: ConnectionId) -> Option<Symbol> {
        self.state.read().by_connection.get(&connection).cloned()
    }

    /// Whether `connection` is currently subscribed to `symbol`.
    #[must_use]
    pub fn is_subscribed(&self, connection: ConnectionId, symbol: &str) -> bool {
        self.state.read().by_connection.get(&connection).map(String::as_str) == Some(symbol)
    }

    /// Every symbol with at least one subscriber, sorted.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let state = self.state.read();
        let sorted: BTreeSet<&Symbol> = state.by_symbol.keys().collect();
        sorted.into_iter().cloned().collect()
    }

    /// Current index statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        SubscriptionStats {
            symbol_count: state.by_symbol.len(),
            subscription_count: state.by_connection.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of index size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of distinct symbol keys with subscribers.
    pub symbol_count: usize,
    /// Number of connections holding a subscription.
    pub subscription_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
