//! Pool of logged-in game accounts that queries are sent through.
//!
//! The pool lives on the tick thread. Picking an account and marking it busy
//! happen in one `&mut` call, so two queries can never both take the last
//! free slot of an account.

use std::collections::BTreeMap;

use quarry_protocol::{Dimension, GamePacket};

/// Identifier of one account in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub u32);

/// Errors from sending through an account.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("account {0:?} is not in the pool")]
    Unknown(AccountId),
    #[error("account connection closed")]
    Closed,
    #[error("account outbound queue full")]
    Full,
}

/// Send side of one account's game connection.
///
/// Lets the scheduler be driven without a real socket.
pub trait AccountLink: Send {
    /// Queue a packet to the game server.
    fn send(&self, packet: GamePacket) -> Result<(), LinkError>;

    /// Whether the connection is still usable.
    fn is_online(&self) -> bool;

    /// Close the connection.
    fn disconnect(&self, _reason: &str) {}
}

struct Account {
    name: String,
    dimension: Dimension,
    link: Box<dyn AccountLink>,
    in_flight: usize,
}

impl Account {
    fn has_room(&self, capacity: usize) -> bool {
        self.in_flight < capacity && self.link.is_online()
    }
}

/// One in-flight slot on an account. Hand it back with
/// [`AccountPool::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct AccountLease {
    account: AccountId,
}

impl AccountLease {
    pub fn account(&self) -> AccountId {
        self.account
    }
}

/// Accounts keyed by id, each with a fixed in-flight capacity.
pub struct AccountPool {
    capacity: usize,
    accounts: BTreeMap<AccountId, Account>,
}

impl AccountPool {
    /// `capacity` is the number of queries one account may carry at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            accounts: BTreeMap::new(),
        }
    }

    /// Add or replace an account.
    pub fn add(
        &mut self,
        id: AccountId,
        name: impl Into<String>,
        dimension: Dimension,
        link: Box<dyn AccountLink>,
    ) {
        let name = name.into();
        tracing::info!(account = %name, ?dimension, "account joined pool");
        self.accounts.insert(
            id,
            Account {
                name,
                dimension,
                link,
                in_flight: 0,
            },
        );
    }

    /// Remove an account. Outstanding leases on it become no-ops.
    pub fn remove(&mut self, id: AccountId) -> bool {
        match self.accounts.remove(&id) {
            Some(account) => {
                tracing::info!(account = %account.name, "account left pool");
                true
            }
            None => false,
        }
    }

    pub fn set_dimension(&mut self, id: AccountId, dimension: Dimension) -> bool {
        match self.accounts.get_mut(&id) {
            Some(account) => {
                account.dimension = dimension;
                true
            }
            None => false,
        }
    }

    pub fn name(&self, id: AccountId) -> Option<&str> {
        self.accounts.get(&id).map(|a| a.name.as_str())
    }

    pub fn dimension(&self, id: AccountId) -> Option<Dimension> {
        self.accounts.get(&id).map(|a| a.dimension)
    }

    /// Account id for a name.
    pub fn find(&self, name: &str) -> Option<AccountId> {
        self.accounts
            .iter()
            .find(|(_, a)| a.name == name)
            .map(|(id, _)| *id)
    }

    /// Ids and names of every account, in id order.
    pub fn iter(&self) -> impl Iterator<Item = (AccountId, &str)> {
        self.accounts.iter().map(|(id, a)| (*id, a.name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn is_online(&self, id: AccountId) -> bool {
        self.accounts.get(&id).is_some_and(|a| a.link.is_online())
    }

    /// Accounts whose connection is still usable.
    pub fn online(&self) -> usize {
        self.accounts.values().filter(|a| a.link.is_online()).count()
    }

    /// Accounts in `dimension` with at least one free slot.
    pub fn available(&self, dimension: Dimension) -> usize {
        self.accounts
            .values()
            .filter(|a| a.dimension == dimension && a.has_room(self.capacity))
            .count()
    }

    /// Close an account's connection. It stays in the pool until removed.
    pub fn disconnect(&self, id: AccountId, reason: &str) -> bool {
        match self.accounts.get(&id) {
            Some(account) => {
                account.link.disconnect(reason);
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self, id: AccountId) -> usize {
        self.accounts.get(&id).map_or(0, |a| a.in_flight)
    }

    /// Take a slot on the least busy account in `dimension`.
    pub fn acquire(&mut self, dimension: Dimension) -> Option<AccountLease> {
        let capacity = self.capacity;
        let (id, account) = self
            .accounts
            .iter_mut()
            .filter(|(_, a)| a.dimension == dimension && a.has_room(capacity))
            .min_by_key(|(_, a)| a.in_flight)?;
        account.in_flight += 1;
        Some(AccountLease { account: *id })
    }

    /// Give a slot back.
    pub fn release(&mut self, lease: AccountLease) {
        if let Some(account) = self.accounts.get_mut(&lease.account) {
            account.in_flight = account.in_flight.saturating_sub(1);
        }
    }

    /// Send through a specific account.
    pub fn send(&self, id: AccountId, packet: impl Into<GamePacket>) -> Result<(), LinkError> {
        let account = self.accounts.get(&id).ok_or(LinkError::Unknown(id))?;
        account.link.send(packet.into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use quarry_protocol::game::ChatMessage;

    /// Records every packet sent through it.
    #[derive(Clone, Default)]
    pub(crate) struct FakeLink {
        pub sent: Arc<Mutex<Vec<GamePacket>>>,
        pub offline: Arc<AtomicBool>,
    }

    impl AccountLink for FakeLink {
        fn send(&self, packet: GamePacket) -> Result<(), LinkError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(LinkError::Closed);
            }
            self.sent.lock().unwrap().push(packet);
            Ok(())
        }

        fn is_online(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_acquire_picks_least_busy() {
        let mut pool = AccountPool::new(2);
        pool.add(AccountId(1), "a", Dimension::Overworld, Box::new(FakeLink::default()));
        pool.add(AccountId(2), "b", Dimension::Overworld, Box::new(FakeLink::default()));

        let first = pool.acquire(Dimension::Overworld).unwrap();
        let second = pool.acquire(Dimension::Overworld).unwrap();
        assert_ne!(first.account(), second.account());
        assert_eq!(pool.available(Dimension::Overworld), 2);

        let _third = pool.acquire(Dimension::Overworld).unwrap();
        let _fourth = pool.acquire(Dimension::Overworld).unwrap();
        assert_eq!(pool.available(Dimension::Overworld), 0);
        assert!(pool.acquire(Dimension::Overworld).is_none());

        pool.release(first);
        assert_eq!(pool.available(Dimension::Overworld), 1);
    }

    #[test]
    fn test_dimension_filter() {
        let mut pool = AccountPool::new(1);
        pool.add(AccountId(1), "a", Dimension::Nether, Box::new(FakeLink::default()));
        assert!(pool.acquire(Dimension::Overworld).is_none());
        assert!(pool.set_dimension(AccountId(1), Dimension::Overworld));
        assert!(pool.acquire(Dimension::Overworld).is_some());
    }

    #[test]
    fn test_offline_accounts_are_skipped() {
        let link = FakeLink::default();
        let mut pool = AccountPool::new(4);
        pool.add(AccountId(7), "a", Dimension::End, Box::new(link.clone()));
        link.offline.store(true, Ordering::SeqCst);
        assert_eq!(pool.online(), 0);
        assert!(pool.acquire(Dimension::End).is_none());
        assert_eq!(
            pool.send(AccountId(7), ChatMessage { message: "hi".into() }),
            Err(LinkError::Closed)
        );
    }

    #[test]
    fn test_release_after_remove_is_noop() {
        let mut pool = AccountPool::new(1);
        pool.add(AccountId(1), "a", Dimension::Overworld, Box::new(FakeLink::default()));
        let lease = pool.acquire(Dimension::Overworld).unwrap();
        assert!(pool.remove(AccountId(1)));
        pool.release(lease);
        assert!(pool.is_empty());
        assert_eq!(pool.find("a"), None);
    }
}
