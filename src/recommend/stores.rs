//! The Recommend Task Service's sub-stores (spec §3): User, Visit, Purchase,
//! Cart, Order, Event, Rate and Query→Purchase-counter, plus the `OrderMap`
//! staging structure used while ingesting order bundles.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::property::Document;

/// One line item within an order, after its item string resolves to an
/// item-id (spec §4.7: "every item string must resolve to an item-id").
#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub item_str: String,
    pub item_id: u64,
    /// Non-empty when the originating record carried a search query the
    /// purchase is attributed to (spec §4.7 query-purchase counter).
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub user: String,
    pub order_id: Option<String>,
    pub items: Vec<OrderItem>,
}

/// Staging map accumulating order items during bundle ingestion, bounded by
/// `MAX_ORDER_NUM` entries (spec §3, §4.7, §8 "OrderMap flush").
pub struct OrderMap {
    entries: HashMap<(String, String), Vec<OrderItem>>,
    max: usize,
}

impl OrderMap {
    pub fn new(max: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max,
        }
    }

    /// Accumulates one order-item. Returns `true` if the map just reached its
    /// bound and should be flushed.
    pub fn insert(&mut self, user: String, order_id: String, item: OrderItem) -> bool {
        self.entries.entry((user, order_id)).or_default().push(item);
        self.entries.len() >= self.max
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains every staged order, handing ownership to the caller for saving.
    pub fn drain(&mut self) -> Vec<OrderRecord> {
        self.entries
            .drain()
            .map(|((user, order_id), items)| OrderRecord {
                user,
                order_id: Some(order_id),
                items,
            })
            .collect()
    }
}

/// The in-process user-profile table; concrete persistence is outside this
/// crate's concern, mirrored here as an in-memory map the way the Document
/// store's contract is narrowed to a trait for the primary index path.
#[derive(Default)]
pub struct UserStore {
    users: Mutex<HashMap<String, Document>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, user: &str, doc: Document) -> Result<()> {
        self.users.lock().await.insert(user.to_string(), doc);
        Ok(())
    }

    pub async fn update(&self, user: &str, doc: Document) -> Result<()> {
        let mut users = self.users.lock().await;
        users.entry(user.to_string()).or_default().extend(doc);
        Ok(())
    }

    pub async fn remove(&self, user: &str) -> Result<()> {
        self.users.lock().await.remove(user);
        Ok(())
    }

    pub async fn get(&self, user: &str) -> Option<Document> {
        self.users.lock().await.get(user).cloned()
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VisitCounters {
    pub visits: u64,
    pub rec_visits: u64,
}

#[derive(Default)]
pub struct VisitStore {
    counters: Mutex<HashMap<(String, u64), VisitCounters>>,
}

impl VisitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, user: &str, item: u64, is_rec_item: bool) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let entry = counters.entry((user.to_string(), item)).or_default();
        entry.visits += 1;
        if is_rec_item {
            entry.rec_visits += 1;
        }
        Ok(())
    }

    pub async fn counters_for(&self, user: &str, item: u64) -> VisitCounters {
        self.counters.lock().await.get(&(user.to_string(), item)).copied().unwrap_or_default()
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct PurchaseStore {
    orders: Mutex<HashMap<String, Vec<u64>>>,
}

impl PurchaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_order(&self, user: &str, items: &[u64]) -> Result<()> {
        self.orders.lock().await.entry(user.to_string()).or_default().extend_from_slice(items);
        Ok(())
    }

    pub async fn items_for(&self, user: &str) -> Vec<u64> {
        self.orders.lock().await.get(user).cloned().unwrap_or_default()
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct CartStore {
    carts: Mutex<HashMap<String, Vec<u64>>>,
}

impl CartStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, user: &str, items: Vec<u64>) -> Result<()> {
        self.carts.lock().await.insert(user.to_string(), items);
        Ok(())
    }

    pub async fn get(&self, user: &str) -> Vec<u64> {
        self.carts.lock().await.get(user).cloned().unwrap_or_default()
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct OrderStore {
    orders: Mutex<Vec<OrderRecord>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, order: OrderRecord) -> Result<()> {
        self.orders.lock().await.push(order);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.orders.lock().await.len()
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub added: bool,
    pub event: String,
    pub user: String,
    pub item: u64,
}

#[derive(Default)]
pub struct EventStore {
    events: Mutex<Vec<EventRecord>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, added: bool, event: &str, user: &str, item: u64) -> Result<()> {
        self.events.lock().await.push(EventRecord {
            added,
            event: event.to_string(),
            user: user.to_string(),
            item,
        });
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RateStore {
    ratings: Mutex<HashMap<(String, u64), f64>>,
}

impl RateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rate(&self, user: &str, item: u64, value: f64) -> Result<()> {
        self.ratings.lock().await.insert((user.to_string(), item), value);
        Ok(())
    }

    pub async fn rating_for(&self, user: &str, item: u64) -> Option<f64> {
        self.ratings.lock().await.get(&(user.to_string(), item)).copied()
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct QueryPurchaseCounterStore {
    clicks: Mutex<HashMap<(String, u64), u64>>,
}

impl QueryPurchaseCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_click(&self, query: &str, item: u64) -> Result<()> {
        *self.clicks.lock().await.entry((query.to_string(), item)).or_insert(0) += 1;
        Ok(())
    }

    pub async fn count_for(&self, query: &str, item: u64) -> u64 {
        self.clicks.lock().await.get(&(query.to_string(), item)).copied().unwrap_or(0)
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(item_id: u64) -> OrderItem {
        OrderItem {
            item_str: item_id.to_string(),
            item_id,
            query: None,
        }
    }

    #[test]
    fn order_map_flushes_at_bound() {
        let mut map = OrderMap::new(2);
        assert!(!map.insert("u1".to_string(), "o1".to_string(), item(1)));
        assert!(map.insert("u2".to_string(), "o2".to_string(), item(2)));
        assert_eq!(map.len(), 2);
        let drained = map.drain();
        assert_eq!(drained.len(), 2);
        assert!(map.is_empty());
    }

    #[test]
    fn order_map_accumulates_items_under_same_key() {
        let mut map = OrderMap::new(1000);
        map.insert("u1".to_string(), "o1".to_string(), item(1));
        map.insert("u1".to_string(), "o1".to_string(), item(2));
        let drained = map.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].items.len(), 2);
    }

    #[tokio::test]
    async fn visit_store_tracks_rec_counter_separately() {
        let store = VisitStore::new();
        store.record("u1", 5, false).await.unwrap();
        store.record("u1", 5, true).await.unwrap();
        let counters = store.counters_for("u1", 5).await;
        assert_eq!(counters.visits, 2);
        assert_eq!(counters.rec_visits, 1);
    }
}
