//! Route templates and the pool → template inverted index.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use types::{EvmAddress, OpportunityKind, PoolId};

/// A candidate route shape over concrete pools. For two-leg templates the
/// pool pair is unordered; the detector evaluates both directions and both
/// entry tokens. Triangular templates fix the pool order and entry token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: usize,
    pub kind: OpportunityKind,
    pub pools: Vec<PoolId>,
    pub entry_token: EvmAddress,
}

/// Template arena plus the inverted index used on every pool update.
#[derive(Default)]
pub struct TemplateIndex {
    templates: DashMap<usize, Template>,
    by_pool: DashMap<PoolId, Vec<usize>>,
    next_id: AtomicUsize,
}

impl TemplateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        kind: OpportunityKind,
        pools: Vec<PoolId>,
        entry_token: EvmAddress,
    ) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        for pool in &pools {
            self.by_pool.entry(*pool).or_default().push(id);
        }
        self.templates.insert(
            id,
            Template {
                id,
                kind,
                pools,
                entry_token,
            },
        );
        id
    }

    /// Whether an equivalent template (same kind, same pool set) exists.
    pub fn contains(&self, kind: OpportunityKind, pools: &[PoolId]) -> bool {
        let mut sorted: Vec<PoolId> = pools.to_vec();
        sorted.sort_unstable();
        self.templates.iter().any(|entry| {
            let template = entry.value();
            if template.kind != kind || template.pools.len() != sorted.len() {
                return false;
            }
            let mut existing = template.pools.clone();
            existing.sort_unstable();
            existing == sorted
        })
    }

    /// Templates touching the updated pool.
    pub fn templates_for_pool(&self, pool: PoolId) -> Vec<Template> {
        let Some(ids) = self.by_pool.get(&pool) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.templates.get(id).map(|t| t.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_index_finds_templates_by_any_member_pool() {
        let index = TemplateIndex::new();
        index.insert(
            OpportunityKind::TwoLeg,
            vec![PoolId(1), PoolId(2)],
            [0x01; 20],
        );
        index.insert(
            OpportunityKind::Triangular,
            vec![PoolId(2), PoolId(3), PoolId(4)],
            [0x01; 20],
        );

        assert_eq!(index.templates_for_pool(PoolId(1)).len(), 1);
        assert_eq!(index.templates_for_pool(PoolId(2)).len(), 2);
        assert_eq!(index.templates_for_pool(PoolId(9)).len(), 0);
    }

    #[test]
    fn contains_ignores_pool_order() {
        let index = TemplateIndex::new();
        index.insert(
            OpportunityKind::TwoLeg,
            vec![PoolId(1), PoolId(2)],
            [0x01; 20],
        );
        assert!(index.contains(OpportunityKind::TwoLeg, &[PoolId(2), PoolId(1)]));
        assert!(!index.contains(OpportunityKind::Triangular, &[PoolId(2), PoolId(1)]));
        assert!(!index.contains(OpportunityKind::TwoLeg, &[PoolId(1), PoolId(3)]));
    }
}
