//! Lossy emission buffer for detected opportunities.
//!
//! Real-time feed semantics: bounded capacity, and under backpressure the
//! freshest, highest-profit candidates survive while the rest are dropped
//! and counted. Consumers always receive the best available candidate first.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use types::Opportunity;

pub struct OpportunityBuffer {
    slots: Mutex<Vec<Opportunity>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl OpportunityBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Insert a candidate. When full, the weakest resident (lowest profit,
    /// oldest on ties) is displaced if the newcomer beats it; otherwise the
    /// newcomer itself is dropped. Returns whether the candidate was kept.
    pub fn push(&self, opportunity: Opportunity) -> bool {
        let mut slots = self.slots.lock();
        if slots.len() < self.capacity {
            slots.push(opportunity);
            drop(slots);
            self.notify.notify_one();
            return true;
        }

        let weakest = slots
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.expected_profit_usd
                    .cmp(&b.expected_profit_usd)
                    .then(a.detected_at_ns.cmp(&b.detected_at_ns))
            })
            .map(|(i, _)| i);

        match weakest {
            Some(index)
                if slots[index].expected_profit_usd < opportunity.expected_profit_usd
                    || (slots[index].expected_profit_usd == opportunity.expected_profit_usd
                        && slots[index].detected_at_ns < opportunity.detected_at_ns) =>
            {
                slots[index] = opportunity;
                self.dropped.fetch_add(1, Ordering::Relaxed);
                drop(slots);
                self.notify.notify_one();
                true
            }
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Take the best available candidate: highest profit, freshest on ties.
    pub fn try_pop(&self) -> Option<Opportunity> {
        let mut slots = self.slots.lock();
        let best = slots
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.expected_profit_usd
                    .cmp(&b.expected_profit_usd)
                    .then(a.detected_at_ns.cmp(&b.detected_at_ns))
            })
            .map(|(i, _)| i)?;
        Some(slots.swap_remove(best))
    }

    /// Await the next candidate.
    pub async fn recv(&self) -> Opportunity {
        loop {
            if let Some(opportunity) = self.try_pop() {
                return opportunity;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
