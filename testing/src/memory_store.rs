//! In-memory document store implementing both store contracts.
//!
//! Records are held as raw JSON documents and pass through
//! [`document::decode`] on every read, exactly like a real adapter, so tests
//! can plant malformed documents. Faults, an offline switch and artificial
//! latency can be injected per operation.

use chrono::{DateTime, Utc};
use equipment_ledger_core::document::{self, Document, Record};
use equipment_ledger_core::environment::Clock;
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::item::{Item, ItemId, ItemPatch, NewItem, ProjectionBatch};
use equipment_ledger_core::loan::{LoanClosure, LoanEvent, LoanId, LoanPage, LoanQuery, LoanStatus, NewLoan};
use equipment_ledger_core::store::{InventoryStore, LedgerStore, LiveQuery, StoreFuture};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Store operations faults can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `LedgerStore::append`
    Append,
    /// `LedgerStore::get` and `LedgerStore::query`
    LedgerRead,
    /// `LedgerStore::close`
    Close,
    /// `LedgerStore::mark_overdue` and `LedgerStore::backfill_display_name`
    LedgerUpdate,
    /// `InventoryStore::create`
    Create,
    /// `InventoryStore::get` and `InventoryStore::list`
    InventoryRead,
    /// `InventoryStore::update`
    Update,
    /// `InventoryStore::commit_batch`
    CommitBatch,
    /// Opening a subscription or producing a subscription snapshot
    Subscribe,
}

#[derive(Debug)]
struct Fault {
    remaining: Option<usize>,
    error: StoreError,
}

#[derive(Default)]
struct Collections {
    inventory: BTreeMap<String, Value>,
    loans: BTreeMap<String, Value>,
}

struct Shared {
    data: Mutex<Collections>,
    faults: Mutex<HashMap<Operation, Fault>>,
    calls: Mutex<HashMap<Operation, usize>>,
    offline: Mutex<bool>,
    latency: Mutex<Duration>,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    inventory_version: watch::Sender<u64>,
    ledger_version: watch::Sender<u64>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn check(&self, op: Operation) -> Result<(), StoreError> {
        *locked(&self.calls).entry(op).or_insert(0) += 1;

        if *locked(&self.offline) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }

        let mut faults = locked(&self.faults);
        let Some(fault) = faults.get_mut(&op) else {
            return Ok(());
        };
        let error = fault.error.clone();
        let exhausted = fault.remaining.as_mut().is_some_and(|n| {
            *n = n.saturating_sub(1);
            *n == 0
        });
        if exhausted {
            faults.remove(&op);
        }
        Err(error)
    }

    async fn enter(&self, op: Operation) -> Result<(), StoreError> {
        let latency = *locked(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check(op)
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{n:04}")
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn items(&self) -> Vec<Item> {
        let data = locked(&self.data);
        data.inventory
            .iter()
            .filter_map(|(id, doc)| match document::decode::<Item>(id, doc.clone()) {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed inventory document");
                    None
                },
            })
            .collect()
    }

    fn loans(&self, query: &LoanQuery) -> LoanPage {
        let data = locked(&self.data);
        let events: Vec<LoanEvent> = data
            .loans
            .iter()
            .filter_map(|(id, doc)| match document::decode::<LoanEvent>(id, doc.clone()) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed ledger document");
                    None
                },
            })
            .collect();
        query.apply(events)
    }

    fn read<R: Record>(&self, id: &str) -> Result<R, StoreError> {
        let data = locked(&self.data);
        let collection = if R::COLLECTION == Item::COLLECTION {
            &data.inventory
        } else {
            &data.loans
        };
        let doc = collection.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            collection: R::COLLECTION,
            id: id.to_string(),
        })?;
        Ok(document::decode(id, doc)?)
    }

    fn write_loan(&self, event: &LoanEvent) -> Result<(), StoreError> {
        let doc = document::encode(event.id.as_str(), event)?;
        locked(&self.data)
            .loans
            .insert(event.id.to_string(), Value::Object(doc));
        self.ledger_version.send_modify(|v| *v += 1);
        Ok(())
    }

    fn bump_inventory(&self) {
        self.inventory_version.send_modify(|v| *v += 1);
    }
}

fn merge(doc: &mut Value, fields: Document) {
    if let Value::Object(doc) = doc {
        doc.extend(fields);
    }
}

/// In-memory backing for [`LedgerStore`] and [`InventoryStore`].
///
/// Cheap to clone; clones share data.
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    shared: Arc<Shared>,
}

impl InMemoryDocumentStore {
    /// An empty store stamping records with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (inventory_version, _) = watch::channel(0);
        let (ledger_version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(Collections::default()),
                faults: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                offline: Mutex::new(false),
                latency: Mutex::new(Duration::ZERO),
                clock,
                next_id: AtomicU64::new(0),
                inventory_version,
                ledger_version,
            }),
        }
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: Operation, times: usize, error: StoreError) {
        locked(&self.shared.faults).insert(
            op,
            Fault {
                remaining: Some(times),
                error,
            },
        );
    }

    /// Fail every call of `op` with `error` until cleared.
    pub fn fail_always(&self, op: Operation, error: StoreError) {
        locked(&self.shared.faults).insert(
            op,
            Fault {
                remaining: None,
                error,
            },
        );
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        locked(&self.shared.faults).clear();
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        *locked(&self.shared.offline) = offline;
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *locked(&self.shared.latency) = latency;
    }

    /// How many times `op` was attempted, including failed attempts.
    #[must_use]
    pub fn calls(&self, op: Operation) -> usize {
        locked(&self.shared.calls).get(&op).copied().unwrap_or(0)
    }

    /// Plant a raw inventory document, bypassing validation.
    pub fn insert_raw_item(&self, id: &str, doc: Value) {
        locked(&self.shared.data).inventory.insert(id.to_string(), doc);
        self.shared.bump_inventory();
    }

    /// Plant a raw ledger document, bypassing validation.
    pub fn insert_raw_loan(&self, id: &str, doc: Value) {
        locked(&self.shared.data).loans.insert(id.to_string(), doc);
        self.shared.ledger_version.send_modify(|v| *v += 1);
    }

    /// Every decodable item, ignoring faults.
    #[must_use]
    pub fn items(&self) -> Vec<Item> {
        self.shared.items()
    }

    /// Every decodable ledger row, newest first, ignoring faults.
    #[must_use]
    pub fn loans(&self) -> Vec<LoanEvent> {
        self.shared.loans(&LoanQuery::all()).loans
    }

    /// One item by id, ignoring faults.
    #[must_use]
    pub fn item(&self, id: &ItemId) -> Option<Item> {
        self.shared.read(id.as_str()).ok()
    }

    /// One ledger row by id, ignoring faults.
    #[must_use]
    pub fn loan(&self, id: &LoanId) -> Option<LoanEvent> {
        self.shared.read(id.as_str()).ok()
    }
}

impl LedgerStore for InMemoryDocumentStore {
    fn append(&self, loan: NewLoan) -> StoreFuture<'_, LoanEvent> {
        Box::pin(async move {
            self.shared.enter(Operation::Append).await?;
            let id = LoanId::new(self.shared.next_id("loan"));
            let event = loan.into_event(id, self.shared.now());
            self.shared.write_loan(&event)?;
            Ok(event)
        })
    }

    fn get(&self, id: LoanId) -> StoreFuture<'_, LoanEvent> {
        Box::pin(async move {
            self.shared.enter(Operation::LedgerRead).await?;
            self.shared.read(id.as_str())
        })
    }

    fn query(&self, query: LoanQuery) -> StoreFuture<'_, LoanPage> {
        Box::pin(async move {
            self.shared.enter(Operation::LedgerRead).await?;
            Ok(self.shared.loans(&query))
        })
    }

    fn close(&self, id: LoanId, closure: LoanClosure) -> StoreFuture<'_, LoanEvent> {
        Box::pin(async move {
            self.shared.enter(Operation::Close).await?;
            let mut event: LoanEvent = self.shared.read(id.as_str())?;
            if !event.is_open() {
                return Err(StoreError::Conflict(format!("loan {id} is already {}", event.status)));
            }
            closure.apply_to(&mut event);
            self.shared.write_loan(&event)?;
            Ok(event)
        })
    }

    fn mark_overdue(&self, id: LoanId, at: DateTime<Utc>) -> StoreFuture<'_, LoanEvent> {
        Box::pin(async move {
            self.shared.enter(Operation::LedgerUpdate).await?;
            let mut event: LoanEvent = self.shared.read(id.as_str())?;
            if event.status != LoanStatus::Active {
                return Err(StoreError::Conflict(format!("loan {id} is {}", event.status)));
            }
            event.status = LoanStatus::Overdue;
            event.updated_at = at;
            self.shared.write_loan(&event)?;
            Ok(event)
        })
    }

    fn backfill_display_name(&self, id: LoanId, display_name: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.shared.enter(Operation::LedgerUpdate).await?;
            let mut event: LoanEvent = self.shared.read(id.as_str())?;
            if event.item_display_name.is_none() {
                event.item_display_name = Some(display_name);
                self.shared.write_loan(&event)?;
            }
            Ok(())
        })
    }

    fn subscribe(&self, query: LoanQuery) -> StoreFuture<'_, LiveQuery<LoanEvent>> {
        Box::pin(async move {
            self.shared.enter(Operation::Subscribe).await?;
            let shared = Arc::clone(&self.shared);
            let mut changes = shared.ledger_version.subscribe();
            changes.mark_changed();

            let stream: LiveQuery<LoanEvent> = Box::pin(async_stream::stream! {
                while changes.changed().await.is_ok() {
                    match shared.check(Operation::Subscribe) {
                        Ok(()) => yield Ok(shared.loans(&query).loans),
                        Err(e) => {
                            yield Err(StoreError::Subscription(e.to_string()));
                            break;
                        },
                    }
                }
            });
            Ok(stream)
        })
    }
}

impl InventoryStore for InMemoryDocumentStore {
    fn create(&self, item: NewItem) -> StoreFuture<'_, Item> {
        Box::pin(async move {
            self.shared.enter(Operation::Create).await?;
            let id = ItemId::new(self.shared.next_id("item"));
            let item = item.into_item(id, self.shared.now());
            let doc = document::encode(item.id.as_str(), &item)?;
            locked(&self.shared.data)
                .inventory
                .insert(item.id.to_string(), Value::Object(doc));
            self.shared.bump_inventory();
            Ok(item)
        })
    }

    fn get(&self, id: ItemId) -> StoreFuture<'_, Item> {
        Box::pin(async move {
            self.shared.enter(Operation::InventoryRead).await?;
            self.shared.read(id.as_str())
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<Item>> {
        Box::pin(async move {
            self.shared.enter(Operation::InventoryRead).await?;
            Ok(self.shared.items())
        })
    }

    fn update(&self, id: ItemId, patch: ItemPatch) -> StoreFuture<'_, Item> {
        Box::pin(async move {
            self.shared.enter(Operation::Update).await?;
            {
                let mut data = locked(&self.shared.data);
                let doc = data.inventory.get_mut(id.as_str()).ok_or_else(|| StoreError::NotFound {
                    collection: Item::COLLECTION,
                    id: id.to_string(),
                })?;
                merge(doc, patch.to_fields());
            }
            self.shared.bump_inventory();
            self.shared.read(id.as_str())
        })
    }

    fn commit_batch(&self, batch: ProjectionBatch) -> StoreFuture<'_, Vec<Item>> {
        Box::pin(async move {
            self.shared.enter(Operation::CommitBatch).await?;
            {
                let mut data = locked(&self.shared.data);
                if let Some((missing, _)) = batch
                    .iter()
                    .find(|(id, _)| !data.inventory.contains_key(id.as_str()))
                {
                    return Err(StoreError::NotFound {
                        collection: Item::COLLECTION,
                        id: missing.to_string(),
                    });
                }
                for (id, patch) in batch.iter() {
                    if let Some(doc) = data.inventory.get_mut(id.as_str()) {
                        merge(doc, patch.to_fields());
                    }
                }
            }
            self.shared.bump_inventory();
            batch
                .iter()
                .map(|(id, _)| self.shared.read(id.as_str()))
                .collect()
        })
    }

    fn subscribe(&self) -> StoreFuture<'_, LiveQuery<Item>> {
        Box::pin(async move {
            self.shared.enter(Operation::Subscribe).await?;
            let shared = Arc::clone(&self.shared);
            let mut changes = shared.inventory_version.subscribe();
            changes.mark_changed();

            let stream: LiveQuery<Item> = Box::pin(async_stream::stream! {
                while changes.changed().await.is_ok() {
                    match shared.check(Operation::Subscribe) {
                        Ok(()) => yield Ok(shared.items()),
                        Err(e) => {
                            yield Err(StoreError::Subscription(e.to_string()));
                            break;
                        },
                    }
                }
            });
            Ok(stream)
        })
    }
}
