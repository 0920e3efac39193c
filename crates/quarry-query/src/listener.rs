//! Per-account packet listeners used to correlate responses with queries.
//!
//! Listeners only ever run on the tick thread: account connections forward
//! their inbound packets over a channel and the runtime dispatches them here.

use std::collections::HashMap;

use quarry_protocol::GamePacket;

use crate::account::AccountId;

/// Callback invoked for every packet an account receives.
pub type PacketListener = Box<dyn FnMut(&GamePacket) + Send>;

/// Handle returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    account: AccountId,
    seq: u64,
}

impl ListenerId {
    pub fn account(&self) -> AccountId {
        self.account
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_seq: u64,
    by_account: HashMap<AccountId, Vec<(u64, PacketListener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, account: AccountId, listener: PacketListener) -> ListenerId {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.by_account
            .entry(account)
            .or_default()
            .push((seq, listener));
        ListenerId { account, seq }
    }

    /// Returns `false` if the listener was already gone.
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let Some(listeners) = self.by_account.get_mut(&id.account) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(seq, _)| *seq != id.seq);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.by_account.remove(&id.account);
        }
        removed
    }

    /// Drop every listener on an account that left the pool.
    pub fn remove_account(&mut self, account: AccountId) -> usize {
        self.by_account.remove(&account).map_or(0, |l| l.len())
    }

    /// Run every listener on `account` in registration order. Returns how
    /// many ran.
    pub fn dispatch(&mut self, account: AccountId, packet: &GamePacket) -> usize {
        let Some(listeners) = self.by_account.get_mut(&account) else {
            return 0;
        };
        for (_, listener) in listeners.iter_mut() {
            listener(packet);
        }
        listeners.len()
    }

    /// Listeners across all accounts.
    pub fn len(&self) -> usize {
        self.by_account.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_account.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use quarry_protocol::game::KeepAlive;

    fn counting(counter: &Arc<AtomicUsize>) -> PacketListener {
        let counter = Arc::clone(counter);
        Box::new(move |_: &GamePacket| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_dispatch_is_per_account() {
        let mut registry = ListenerRegistry::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        registry.register(AccountId(1), counting(&a));
        registry.register(AccountId(2), counting(&b));

        let packet = GamePacket::from(KeepAlive { id: 1 });
        assert_eq!(registry.dispatch(AccountId(1), &packet), 1);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregistered_listener_is_not_called() {
        let mut registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = registry.register(AccountId(1), counting(&hits));
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());

        registry.dispatch(AccountId(1), &GamePacket::from(KeepAlive { id: 2 }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_account_drops_listeners() {
        let mut registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(AccountId(3), counting(&hits));
        registry.register(AccountId(3), counting(&hits));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.remove_account(AccountId(3)), 2);
        assert_eq!(registry.len(), 0);
    }
}
