use crate::Error;
use std::collections::BTreeMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Top half of the AES counter, per direction.
#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    ours: u64,
    theirs: u64,
}

/// Counters indexed by (our key id, their key id).
#[derive(Clone, Debug, Default)]
pub(crate) struct CounterHistory {
    counters: BTreeMap<(u32, u32), Counters>,
}

impl CounterHistory {
    /// Advances and returns our counter for the key pair. The first value is 1.
    pub(crate) fn next_sending(&mut self, our_key_id: u32, their_key_id: u32) -> u64 {
        let counters = self.counters.entry((our_key_id, their_key_id)).or_default();
        counters.ours += 1;
        counters.ours
    }

    /// Fails unless `counter` is above every counter seen for the key pair.
    pub(crate) fn check_receiving(
        &self,
        our_key_id: u32,
        their_key_id: u32,
        counter: u64,
    ) -> Result<(), Error> {
        let seen = self
            .counters
            .get(&(our_key_id, their_key_id))
            .map_or(0, |counters| counters.theirs);
        if counter <= seen {
            return Err(Error::Unreadable("Counter regressed".to_string()));
        }
        Ok(())
    }

    pub(crate) fn commit_receiving(&mut self, our_key_id: u32, their_key_id: u32, counter: u64) {
        self.counters
            .entry((our_key_id, their_key_id))
            .or_default()
            .theirs = counter;
    }

    /// Drops counters of key pairs that can no longer be selected.
    pub(crate) fn prune(&mut self, min_our_key_id: u32, min_their_key_id: u32) {
        self.counters
            .retain(|(ours, theirs), _| *ours >= min_our_key_id && *theirs >= min_their_key_id);
    }

    pub(crate) fn clear(&mut self) {
        self.counters.clear();
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct MacKeyUsage {
    our_key_id: u32,
    their_key_id: u32,
    key: [u8; 20],
}

/// Receiving MAC keys that have authenticated at least one message.
#[derive(Clone, Default, Zeroize)]
pub(crate) struct MacKeyHistory {
    items: Vec<MacKeyUsage>,
}

impl MacKeyHistory {
    pub(crate) fn add(&mut self, our_key_id: u32, their_key_id: u32, key: [u8; 20]) {
        let known = self
            .items
            .iter()
            .any(|item| item.our_key_id == our_key_id && item.their_key_id == their_key_id);
        if !known {
            self.items.push(MacKeyUsage {
                our_key_id,
                their_key_id,
                key,
            });
        }
    }

    /// Removes and returns the keys used with our key `our_key_id`.
    pub(crate) fn forget_our_key(&mut self, our_key_id: u32) -> Vec<[u8; 20]> {
        self.forget(|item| item.our_key_id == our_key_id)
    }

    /// Removes and returns the keys used with their key `their_key_id`.
    pub(crate) fn forget_their_key(&mut self, their_key_id: u32) -> Vec<[u8; 20]> {
        self.forget(|item| item.their_key_id == their_key_id)
    }

    fn forget(&mut self, matches: impl Fn(&MacKeyUsage) -> bool) -> Vec<[u8; 20]> {
        let mut revealed = Vec::new();
        self.items.retain(|item| {
            if matches(item) {
                revealed.push(item.key);
                false
            } else {
                true
            }
        });
        revealed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
