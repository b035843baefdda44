//! The Recommend Task Service itself: live ingest operations, the bulk
//! `buildCollection` pass, and the 60-second cron loop (spec §4.7).

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bundle::parser::BundleFileParser;
use crate::bundle::scanner;
use crate::bundle::BundleFileType;
use crate::collaborators::{ItemIdGenerator, RecommendMatrix, UpdateRecommendBase};
use crate::config::Config;
use crate::directory::DirectoryPair;
use crate::error::Result;
use crate::property::{Document, PropertyValue};
use crate::recommend::stores::{
    CartStore, EventStore, OrderItem, OrderMap, OrderRecord, OrderStore, PurchaseStore, QueryPurchaseCounterStore,
    RateStore, UserStore, VisitStore,
};

/// Property names used within order-bundle records (spec §4.7); not part of
/// the document schema proper, since order ingestion is a separate stream.
pub const ORDER_ID_PROPERTY: &str = "ORDERID";
pub const ITEM_PROPERTY: &str = "ITEMID";
pub const QUERY_PROPERTY: &str = "QUERY";

pub struct RecommendTaskService {
    collection: String,
    directories: Arc<DirectoryPair>,
    item_ids: Arc<dyn ItemIdGenerator>,
    recommend_base: Arc<dyn UpdateRecommendBase>,
    matrix: Arc<dyn RecommendMatrix>,
    config: Config,

    user_store: UserStore,
    visit_store: VisitStore,
    purchase_store: PurchaseStore,
    cart_store: CartStore,
    order_store: OrderStore,
    event_store: EventStore,
    rate_store: RateStore,
    query_counter_store: QueryPurchaseCounterStore,

    build_mutex: Mutex<()>,
    cron_schedule: Schedule,
}

impl RecommendTaskService {
    pub fn new(
        collection: impl Into<String>,
        directories: Arc<DirectoryPair>,
        item_ids: Arc<dyn ItemIdGenerator>,
        recommend_base: Arc<dyn UpdateRecommendBase>,
        matrix: Arc<dyn RecommendMatrix>,
        config: Config,
    ) -> Result<Self> {
        let cron_schedule = Schedule::from_str(&config.recommend_cron)
            .map_err(|e| crate::error::Error::bad_format(format!("invalid cron expression: {e}")))?;
        Ok(Self {
            collection: collection.into(),
            directories,
            item_ids,
            recommend_base,
            matrix,
            config,
            user_store: UserStore::new(),
            visit_store: VisitStore::new(),
            purchase_store: PurchaseStore::new(),
            cart_store: CartStore::new(),
            order_store: OrderStore::new(),
            event_store: EventStore::new(),
            rate_store: RateStore::new(),
            query_counter_store: QueryPurchaseCounterStore::new(),
            build_mutex: Mutex::new(()),
            cron_schedule,
        })
    }

    pub async fn add_user(&self, user: &str, doc: Document) -> bool {
        self.user_store.add(user, doc).await.is_ok()
    }

    pub async fn update_user(&self, user: &str, doc: Document) -> bool {
        self.user_store.update(user, doc).await.is_ok()
    }

    pub async fn remove_user(&self, user: &str) -> bool {
        self.user_store.remove(user).await.is_ok()
    }

    /// Records a visit (spec §4.7 `visitItem`); rejects an empty session and
    /// an item string the id generator cannot resolve.
    pub async fn visit_item(&self, session: &str, user: &str, item_str: &str, is_rec_item: bool) -> bool {
        if session.is_empty() {
            warn!(user, item_str, "rejecting visit with empty session");
            return false;
        }
        let Some(item_id) = self.item_ids.str_id_to_item_id(item_str).await else {
            warn!(item_str, "visit item does not resolve to an item-id");
            return false;
        };
        if let Err(e) = self.visit_store.record(user, item_id, is_rec_item).await {
            warn!(error = %e, "failed to record visit");
            return false;
        }
        if let Err(e) = self.matrix.record_visit(user, item_id).await {
            warn!(error = %e, "failed to forward visit to recommend matrix");
        }
        true
    }

    /// Live purchase API (spec §4.7 `purchaseItem`): a single immediate order,
    /// distinct from the bulk order-bundle ingestion in [`Self::build_collection`].
    pub async fn purchase_item(&self, user: &str, order_id: Option<&str>, item_strs: &[String]) -> bool {
        let mut items = Vec::with_capacity(item_strs.len());
        for item_str in item_strs {
            let Some(item_id) = self.item_ids.str_id_to_item_id(item_str).await else {
                warn!(item_str, "purchase item does not resolve to an item-id, aborting order");
                return false;
            };
            items.push(OrderItem {
                item_str: item_str.clone(),
                item_id,
                query: None,
            });
        }
        self.save_order(&OrderRecord {
            user: user.to_string(),
            order_id: order_id.map(str::to_string),
            items,
        })
        .await
    }

    pub async fn update_cart(&self, user: &str, item_strs: &[String]) -> bool {
        let mut items = Vec::with_capacity(item_strs.len());
        for item_str in item_strs {
            match self.item_ids.str_id_to_item_id(item_str).await {
                Some(id) => items.push(id),
                None => {
                    warn!(item_str, "cart item does not resolve to an item-id, skipping");
                }
            }
        }
        self.cart_store.set(user, items).await.is_ok()
    }

    pub async fn track_event(&self, added: bool, event: &str, user: &str, item_str: &str) -> bool {
        let Some(item_id) = self.item_ids.str_id_to_item_id(item_str).await else {
            return false;
        };
        self.event_store.track(added, event, user, item_id).await.is_ok()
    }

    pub async fn rate_item(&self, user: &str, item_str: &str, value: f64) -> bool {
        let Some(item_id) = self.item_ids.str_id_to_item_id(item_str).await else {
            return false;
        };
        self.rate_store.rate(user, item_id, value).await.is_ok()
    }

    /// Order-saving invariants (spec §4.7 last paragraph): the order store
    /// always records the order; the purchase store records the user→items
    /// link; the query-purchase counter records a click for every item whose
    /// query is non-empty. Each is attempted independently; the returned flag
    /// is the AND-reduction of all three.
    async fn save_order(&self, record: &OrderRecord) -> bool {
        let mut ok = true;

        if let Err(e) = self.order_store.record(record.clone()).await {
            warn!(error = %e, user = %record.user, "failed to record order");
            ok = false;
        }

        let item_ids: Vec<u64> = record.items.iter().map(|i| i.item_id).collect();
        if let Err(e) = self.purchase_store.record_order(&record.user, &item_ids).await {
            warn!(error = %e, user = %record.user, "failed to record purchase link");
            ok = false;
        }
        if let Err(e) = self.matrix.record_purchase(&record.user, &item_ids).await {
            warn!(error = %e, user = %record.user, "failed to forward purchase to recommend matrix");
        }

        for item in &record.items {
            if let Some(query) = item.query.as_deref() {
                if !query.is_empty() {
                    if let Err(e) = self.query_counter_store.record_click(query, item.item_id).await {
                        warn!(error = %e, query, "failed to record query-purchase click");
                        ok = false;
                    }
                }
            }
        }

        ok
    }

    /// Bulk ingest from user SCD and order SCD bundles (spec §4.7 `buildCollection`).
    pub async fn build_collection(&self, user_bundle_dir: &Path, order_bundle_dir: &Path) -> Result<()> {
        let mut guard = self.directories.current().guard()?;
        match self.build_collection_inner(user_bundle_dir, order_bundle_dir).await {
            Ok(()) => Ok(()),
            Err(e) => {
                guard.poison();
                Err(e)
            }
        }
    }

    async fn build_collection_inner(&self, user_bundle_dir: &Path, order_bundle_dir: &Path) -> Result<()> {
        self.directories.backup().await?;
        let _held = self.build_mutex.lock().await;

        let user_files = scanner::scan(user_bundle_dir, &self.collection).await?;
        for file in &user_files {
            let mut parser = BundleFileParser::open(&file.path).await?;
            while let Some(record) = parser.next_record().await? {
                let mut doc: Document = Document::new();
                for (name, value) in &record.properties {
                    if name == crate::bundle::parser::USERID_DELIMITER {
                        continue;
                    }
                    doc.insert(name.clone(), PropertyValue::Str(value.clone()));
                }
                match file.name.file_type {
                    BundleFileType::Insert => {
                        self.user_store.add(&record.id, doc).await?;
                    }
                    BundleFileType::Update => {
                        self.user_store.update(&record.id, doc).await?;
                    }
                    BundleFileType::Delete => {
                        self.user_store.remove(&record.id).await?;
                    }
                    BundleFileType::Rebuild => {
                        warn!(file = %file.name.raw, "Rebuild-tagged bundle in user stream; ignoring");
                    }
                }
            }
        }
        self.user_store.flush().await?;
        for file in &user_files {
            scanner::backup_file(&self.directories.current().backup_dir(), file).await;
        }

        let order_files = scanner::scan(order_bundle_dir, &self.collection).await?;
        let mut order_map = OrderMap::new(self.config.max_order_num);
        for file in &order_files {
            if file.name.file_type != BundleFileType::Insert {
                warn!(file = %file.name.raw, "order bundles only accept insert type; skipping");
                continue;
            }
            let mut parser = BundleFileParser::open(&file.path).await?;
            while let Some(record) = parser.next_record().await? {
                self.ingest_order_record(&record, &mut order_map).await;
            }
            // Every accumulated order is written out before its enclosing
            // file finishes parsing (spec §8 "OrderMap flush").
            self.flush_order_map(&mut order_map).await;
        }
        self.order_store.flush().await?;
        self.purchase_store.flush().await?;

        self.build_frequent_item_sets().await;
        self.recommend_base.build_purchase_sim_matrix().await?;
        self.recommend_base.flush_recommend_matrix().await?;

        for file in &order_files {
            scanner::backup_file(&self.directories.current().backup_dir(), file).await;
        }

        Ok(())
    }

    async fn ingest_order_record(&self, record: &crate::bundle::parser::RawRecord, order_map: &mut OrderMap) {
        let find = |name: &str| record.properties.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone());
        let Some(item_str) = find(ITEM_PROPERTY) else {
            warn!(user = %record.id, "order record missing item property, skipping");
            return;
        };
        let Some(item_id) = self.item_ids.str_id_to_item_id(&item_str).await else {
            warn!(item_str, "order item does not resolve to an item-id, aborting this order");
            return;
        };
        let item = OrderItem {
            item_str,
            item_id,
            query: find(QUERY_PROPERTY),
        };

        match find(ORDER_ID_PROPERTY).filter(|id| !id.is_empty()) {
            None => {
                self.save_order(&OrderRecord {
                    user: record.id.clone(),
                    order_id: None,
                    items: vec![item],
                })
                .await;
            }
            Some(order_id) => {
                if order_map.insert(record.id.clone(), order_id, item) {
                    self.flush_order_map(order_map).await;
                }
            }
        }
    }

    async fn flush_order_map(&self, order_map: &mut OrderMap) {
        for record in order_map.drain() {
            self.save_order(&record).await;
        }
    }

    async fn build_frequent_item_sets(&self) {
        debug!(collection = %self.collection, "frequent item set construction not enabled");
    }

    /// Starts the 60-second cron loop (spec §4.7, §5). Returns a handle that
    /// stops the loop and joins it.
    pub fn start_cron(self: Arc<Self>) -> CronHandle {
        let shutdown = Arc::new(Notify::new());
        let worker_shutdown = shutdown.clone();
        let service = self;
        let handle = tokio::spawn(async move {
            let mut last_check = Utc::now();
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    biased;
                    _ = worker_shutdown.notified() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        if service.cron_schedule.after(&last_check).take_while(|t| *t <= now).next().is_some() {
                            service.run_cron_tick().await;
                        }
                        last_check = now;
                        let _ = &now;
                    }
                }
            }
        });
        CronHandle { shutdown, handle: Some(handle) }
    }

    async fn run_cron_tick(&self) {
        let Ok(_held) = self.build_mutex.try_lock() else {
            info!(collection = %self.collection, "exit recommend cron job");
            return;
        };
        if let Err(e) = self.flush_all_stores().await {
            warn!(error = %e, "cron tick failed to flush stores");
            return;
        }
        self.build_frequent_item_sets().await;
        if self.recommend_base.need_rebuild_purchase_sim_matrix().await {
            if let Err(e) = self.recommend_base.build_purchase_sim_matrix().await {
                warn!(error = %e, "cron-triggered similarity rebuild failed");
                return;
            }
        }
        if let Err(e) = self.recommend_base.flush_recommend_matrix().await {
            warn!(error = %e, "cron tick failed to flush recommend matrix");
        }
    }

    async fn flush_all_stores(&self) -> Result<()> {
        self.user_store.flush().await?;
        self.visit_store.flush().await?;
        self.purchase_store.flush().await?;
        self.cart_store.flush().await?;
        self.order_store.flush().await?;
        self.event_store.flush().await?;
        self.rate_store.flush().await?;
        self.query_counter_store.flush().await?;
        Ok(())
    }
}

/// Handle returned by [`RecommendTaskService::start_cron`]; dropping it leaves
/// the loop running. Call [`CronHandle::stop`] to end it.
pub struct CronHandle {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl CronHandle {
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use crate::testing::{InMemoryItemIdGenerator, InMemoryRecommendMatrix, InMemoryUpdateRecommendBase};

    fn service(dir: &tempfile::TempDir) -> Arc<RecommendTaskService> {
        let pair = Arc::new(DirectoryPair::new(
            Directory::new("a", dir.path().join("a")),
            Directory::new("b", dir.path().join("b")),
        ));
        let mut config = Config::default_with_dir(dir.path().join("data"));
        config.recommend_cron = "0 * * * * *".to_string();
        Arc::new(
            RecommendTaskService::new(
                "c1",
                pair,
                Arc::new(InMemoryItemIdGenerator::new()),
                Arc::new(InMemoryUpdateRecommendBase::new()),
                Arc::new(InMemoryRecommendMatrix::new()),
                config,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn visit_item_rejects_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        assert!(!svc.visit_item("", "u1", "item1", false).await);
    }

    #[tokio::test]
    async fn visit_item_records_and_feeds_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        assert!(svc.visit_item("s1", "u1", "item1", true).await);
        let counters = svc.visit_store.counters_for("u1", 0).await;
        assert_eq!(counters.visits, 1);
        assert_eq!(counters.rec_visits, 1);
    }

    #[tokio::test]
    async fn purchase_item_saves_order_and_purchase_link() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        assert!(svc.purchase_item("u1", Some("o1"), &["item1".to_string(), "item2".to_string()]).await);
        assert_eq!(svc.order_store.len().await, 1);
        assert_eq!(svc.purchase_store.items_for("u1").await.len(), 2);
    }

    /// Spec §8 scenario 4 ("Build with concurrent cron tick"): while
    /// `buildCollection` holds `build_mutex`, a cron tick must try-acquire,
    /// fail, and skip without mutating any store.
    #[tokio::test]
    async fn cron_tick_skips_while_build_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let pair = Arc::new(DirectoryPair::new(
            Directory::new("a", dir.path().join("a")),
            Directory::new("b", dir.path().join("b")),
        ));
        let mut config = Config::default_with_dir(dir.path().join("data"));
        config.recommend_cron = "0 * * * * *".to_string();
        let recommend_base = Arc::new(InMemoryUpdateRecommendBase::new());
        let svc = Arc::new(
            RecommendTaskService::new(
                "c1",
                pair,
                Arc::new(InMemoryItemIdGenerator::new()),
                recommend_base.clone(),
                Arc::new(InMemoryRecommendMatrix::new()),
                config,
            )
            .unwrap(),
        );

        let held = svc.build_mutex.lock().await;
        svc.run_cron_tick().await;
        drop(held);

        assert_eq!(recommend_base.build_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(recommend_base.flush_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn order_map_overflow_flushes_all_records_by_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let pair = Arc::new(DirectoryPair::new(
            Directory::new("a", dir.path().join("a")),
            Directory::new("b", dir.path().join("b")),
        ));
        let mut config = Config::default_with_dir(dir.path().join("data"));
        config.max_order_num = 2;
        let svc = Arc::new(
            RecommendTaskService::new(
                "c1",
                pair,
                Arc::new(InMemoryItemIdGenerator::new()),
                Arc::new(InMemoryUpdateRecommendBase::new()),
                Arc::new(InMemoryRecommendMatrix::new()),
                config,
            )
            .unwrap(),
        );

        let user_dir = dir.path().join("users");
        let order_dir = dir.path().join("orders");
        tokio::fs::create_dir_all(&user_dir).await.unwrap();
        tokio::fs::create_dir_all(&order_dir).await.unwrap();

        let mut body = String::new();
        for i in 0..5 {
            body.push_str(&format!("<USERID>u{i}\n<ORDERID>o{i}\n<ITEMID>item{i}\n"));
        }
        tokio::fs::write(order_dir.join("B-01-202401010000-000000-I-c1.SCD"), body).await.unwrap();

        svc.build_collection(&user_dir, &order_dir).await.unwrap();
        assert_eq!(svc.order_store.len().await, 5);
    }
}
