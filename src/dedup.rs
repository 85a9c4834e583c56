use heapless::Deque;
use static_assertions::const_assert;

use crate::protocol::CommandAck;

pub const DEDUP_CAPACITY: usize = 64;
const_assert!(DEDUP_CAPACITY > 0);

pub const DEFAULT_DEDUP_EXPIRY_MS: u64 = 600_000;

#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub ack: CommandAck,
    pub seen_at_ms: u64,
}

/// Recently seen command ids and the ack each one produced.
///
/// Entries are kept in arrival order, so expiry and overflow both drop from
/// the front.
#[derive(Debug)]
pub struct CommandDedupWindow {
    entries: Deque<DedupEntry, DEDUP_CAPACITY>,
    expiry_ms: u64,
    evicted: u32,
}

impl CommandDedupWindow {
    pub fn new(expiry_ms: u64) -> Self {
        Self {
            entries: Deque::new(),
            expiry_ms,
            evicted: 0,
        }
    }

    pub fn lookup(&mut self, id: &str, now_ms: u64) -> Option<&CommandAck> {
        self.purge_expired(now_ms);
        self.entries
            .iter()
            .find(|entry| entry.ack.id == id)
            .map(|entry| &entry.ack)
    }

    pub fn record(&mut self, ack: CommandAck, now_ms: u64) {
        self.purge_expired(now_ms);

        if self.entries.is_full() {
            self.entries.pop_front();
            self.evicted = self.evicted.saturating_add(1);
        }
        let _ = self.entries.push_back(DedupEntry {
            ack,
            seen_at_ms: now_ms,
        });
    }

    pub fn purge_expired(&mut self, now_ms: u64) {
        while let Some(front) = self.entries.front() {
            if now_ms.saturating_sub(front.seen_at_ms) <= self.expiry_ms {
                break;
            }
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped because the window was full.
    pub fn evicted_count(&self) -> u32 {
        self.evicted
    }
}
