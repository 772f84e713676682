// Token price cache
//
// Prices fetched from the network collaborator are kept per token with a
// time to live. Stale entries are never served; they are refetched.

use crate::types::{Timestamp, TokenId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One cached price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPrice {
    pub price: Decimal,
    pub fetched_at: Timestamp,
    /// Time to live in milliseconds before this price is considered stale
    pub ttl_ms: i64,
}

impl CachedPrice {
    pub fn new(price: Decimal, fetched_at: Timestamp, ttl_ms: i64) -> Self {
        Self {
            price,
            fetched_at,
            ttl_ms,
        }
    }

    pub fn is_stale(&self, now: Timestamp) -> bool {
        now.millis_since(self.fetched_at) >= self.ttl_ms
    }
}

/// Result of a cache lookup: what was fresh, and what still needs fetching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheLookup {
    pub hits: HashMap<TokenId, Decimal>,
    pub missing: Vec<TokenId>,
}

#[derive(Debug, Clone)]
pub struct PriceCache {
    ttl_ms: i64,
    entries: HashMap<TokenId, CachedPrice>,
    hits: u64,
    misses: u64,
}

impl PriceCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    pub fn set_ttl(&mut self, ttl_ms: i64) {
        self.ttl_ms = ttl_ms;
    }

    pub fn lookup(&mut self, tokens: &[TokenId], now: Timestamp) -> CacheLookup {
        let mut result = CacheLookup::default();
        for token in tokens {
            match self.entries.get(token) {
                Some(entry) if !entry.is_stale(now) => {
                    self.hits += 1;
                    result.hits.insert(token.clone(), entry.price);
                }
                _ => {
                    self.misses += 1;
                    if !result.missing.contains(token) {
                        result.missing.push(token.clone());
                    }
                }
            }
        }
        result
    }

    pub fn store(&mut self, prices: &HashMap<TokenId, Decimal>, now: Timestamp) {
        for (token, price) in prices {
            self.entries
                .insert(token.clone(), CachedPrice::new(*price, now, self.ttl_ms));
        }
    }

    /// Drop everything stale as of `now`.
    pub fn evict_stale(&mut self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(now));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits
    }

    pub fn miss_count(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn prices(pairs: &[(&str, Decimal)]) -> HashMap<TokenId, Decimal> {
        pairs.iter().map(|(t, p)| (TokenId::new(*t), *p)).collect()
    }

    #[test]
    fn cached_price_staleness() {
        let p = CachedPrice::new(dec!(1.5), Timestamp::from_millis(1_000), 500);
        assert!(!p.is_stale(Timestamp::from_millis(1_499)));
        assert!(p.is_stale(Timestamp::from_millis(1_500)));
    }

    #[test]
    fn lookup_splits_hits_and_misses() {
        let mut cache = PriceCache::new(1_000);
        cache.store(&prices(&[("RON", dec!(2)), ("AXS", dec!(7))]), Timestamp::from_millis(0));

        let tokens = vec![TokenId::new("RON"), TokenId::new("SLP")];
        let lookup = cache.lookup(&tokens, Timestamp::from_millis(500));
        assert_eq!(lookup.hits.get(&TokenId::new("RON")), Some(&dec!(2)));
        assert_eq!(lookup.missing, vec![TokenId::new("SLP")]);
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn stale_entries_are_refetched_and_evicted() {
        let mut cache = PriceCache::new(1_000);
        cache.store(&prices(&[("RON", dec!(2))]), Timestamp::from_millis(0));

        let lookup = cache.lookup(&[TokenId::new("RON")], Timestamp::from_millis(1_000));
        assert!(lookup.hits.is_empty());
        assert_eq!(lookup.missing.len(), 1);

        assert_eq!(cache.evict_stale(Timestamp::from_millis(1_000)), 1);
        assert!(cache.is_empty());
    }
}
