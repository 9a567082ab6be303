//! Optimistic mutations against the directory collection.
//!
//! Every write follows the same lifecycle:
//!
//! 1. Under the cache lock, snapshot the collection and write the
//!    provisional result (`ResourceCache::apply`).
//! 2. Issue the remote call.
//! 3. On success, mark the cache stale and refetch: server truth replaces
//!    the provisional state even if they disagree.
//! 4. On failure, roll back to the snapshot and return the error. There is
//!    no automatic retry.
//!
//! Races on the same record are resolved by supersession: each mutation
//! takes a token for its record id, and a settlement whose token is no longer
//! the newest skips its rollback, because the newer mutation owns the
//! record's cached state. The cache is invalidated instead so the next read
//! refetches.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::{CacheSnapshot, ResourceCache};
use crate::client::RemoteResourceClient;
use crate::error::Error;
use crate::model::{Directory, DirectoryCreate, DirectoryUpdate};
use crate::telemetry::{ReportedError, TelemetryBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Create,
    Update,
    Toggle,
    Delete,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Toggle => "toggle",
            Operation::Delete => "delete",
        }
    }
}

/// State held from the optimistic write until the remote call settles.
struct PendingMutation {
    operation: Operation,
    /// Record id for update/toggle/delete; provisional id for create.
    key: i64,
    token: u64,
    snapshot: CacheSnapshot,
    written_version: u64,
}

/// Applies create/update/toggle/delete optimistically and reconciles with
/// the server.
pub struct MutationCoordinator<C: RemoteResourceClient + 'static> {
    client: Arc<C>,
    cache: Arc<ResourceCache>,
    telemetry: Option<Arc<TelemetryBuffer<C>>>,
    in_flight: Mutex<HashMap<i64, u64>>,
    next_token: AtomicU64,
    next_provisional_id: AtomicI64,
}

impl<C: RemoteResourceClient + 'static> MutationCoordinator<C> {
    pub fn new(client: Arc<C>, cache: Arc<ResourceCache>) -> Self {
        Self {
            client,
            cache,
            telemetry: None,
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            next_provisional_id: AtomicI64::new(-1),
        }
    }

    /// Reports failed operations to `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryBuffer<C>>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<i64, u64>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached collection, refetching it first if stale.
    pub async fn list(&self) -> Result<CacheSnapshot, Error> {
        if self.cache.is_stale() {
            if let Err(e) = self.refresh().await {
                self.report("list", None, &e);
                return Err(e);
            }
        }
        Ok(self.cache.read())
    }

    /// Fetches one record straight from the server.
    pub async fn get(&self, id: i64) -> Result<Directory, Error> {
        self.client.get(id).await.inspect_err(|e| self.report("get", Some(id), e))
    }

    /// Refetches the collection from the server.
    ///
    /// Returns `false` if the response was discarded because a local write
    /// happened while it was in flight; the cache then stays stale.
    pub async fn refresh(&self) -> Result<bool, Error> {
        let started_at = self.cache.version();
        let records = self.client.list().await?;
        let count = records.len();
        let installed = self.cache.load(records, started_at);
        if installed {
            debug!(count, "directory cache refreshed");
        }
        Ok(installed)
    }

    /// Creates a directory. A provisional record with a negative id is
    /// appended to the cache until the server's copy is refetched.
    pub async fn create(&self, input: DirectoryCreate) -> Result<Directory, Error> {
        let provisional_id = self.next_provisional_id.fetch_sub(1, Ordering::Relaxed);
        let pending = self
            .begin(Operation::Create, provisional_id, |records| {
                input.validate()?;
                let mut next = records.to_vec();
                next.push(Directory::provisional(provisional_id, &input, Utc::now()));
                Ok(next)
            })
            .await?;
        self.settle(pending, self.client.create(&input)).await
    }

    /// Shallow-merges `patch` over the record and replaces it server-side.
    pub async fn update(&self, id: i64, patch: DirectoryUpdate) -> Result<Directory, Error> {
        let pending = self
            .begin(Operation::Update, id, |records| {
                patch.validate()?;
                replace_record(records, id, |current| patch.apply_to(current, Utc::now()))
            })
            .await?;
        self.settle(pending, self.client.replace(id, &patch)).await
    }

    /// Flips the enabled flag of the record.
    pub async fn toggle(&self, id: i64) -> Result<Directory, Error> {
        let pending = self
            .begin(Operation::Toggle, id, |records| {
                replace_record(records, id, |current| {
                    DirectoryUpdate::toggle_of(current).apply_to(current, Utc::now())
                })
            })
            .await?;
        self.settle(pending, self.client.toggle(id)).await
    }

    /// Removes the record.
    pub async fn delete(&self, id: i64) -> Result<(), Error> {
        let pending = self
            .begin(Operation::Delete, id, |records| {
                if !records.iter().any(|record| record.id == id) {
                    return Err(Error::NotFound(id));
                }
                Ok(records.iter().filter(|r| r.id != id).cloned().collect())
            })
            .await?;
        self.settle(pending, self.client.delete(id)).await
    }

    /// Loads the collection if it was never fetched, so ids can be located.
    async fn ensure_loaded(&self) -> Result<(), Error> {
        if !self.cache.is_loaded() {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Snapshot + provisional write + token registration, all before any
    /// network call is issued. Failures here (invalid input, unknown id,
    /// provisional id) are reported and leave the cache untouched.
    async fn begin<F>(&self, operation: Operation, key: i64, edit: F) -> Result<PendingMutation, Error>
    where
        F: FnOnce(&[Directory]) -> Result<Vec<Directory>, Error>,
    {
        let id = (operation != Operation::Create).then_some(key);
        let started = async {
            if id.is_some_and(|id| id < 0) {
                return Err(Error::Validation(
                    "record is still being created".to_string(),
                ));
            }
            self.ensure_loaded().await?;
            self.cache.apply(edit)
        };
        let (snapshot, written_version) = started
            .await
            .inspect_err(|e| self.report(operation.as_str(), id, e))?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.in_flight().insert(key, token) {
            debug!(
                operation = operation.as_str(),
                id = key,
                superseded_token = previous,
                "mutation supersedes one still in flight"
            );
        }
        Ok(PendingMutation {
            operation,
            key,
            token,
            snapshot,
            written_version,
        })
    }

    /// Awaits the remote call and commits or rolls back.
    async fn settle<T>(
        &self,
        pending: PendingMutation,
        remote: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        let result = remote.await;
        let latest = self.finish(&pending);

        match result {
            Ok(value) => {
                info!(
                    operation = pending.operation.as_str(),
                    id = pending.key,
                    "mutation confirmed"
                );
                self.cache.invalidate();
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "refetch after mutation failed; cache left stale");
                }
                Ok(value)
            }
            Err(e) => {
                if latest {
                    self.rollback(&pending);
                } else {
                    debug!(
                        operation = pending.operation.as_str(),
                        id = pending.key,
                        "superseded mutation failed; skipping rollback"
                    );
                    self.cache.invalidate();
                }
                warn!(
                    operation = pending.operation.as_str(),
                    id = pending.key,
                    error = %e,
                    "mutation failed"
                );
                let id = (pending.operation != Operation::Create).then_some(pending.key);
                self.report(pending.operation.as_str(), id, &e);
                Err(e)
            }
        }
    }

    /// Releases the token. Returns whether it was still the newest for its key.
    fn finish(&self, pending: &PendingMutation) -> bool {
        let mut in_flight = self.in_flight();
        match in_flight.get(&pending.key) {
            Some(&token) if token == pending.token => {
                in_flight.remove(&pending.key);
                true
            }
            _ => false,
        }
    }

    fn rollback(&self, pending: &PendingMutation) {
        let key = pending.key;
        let operation = pending.operation;
        self.cache
            .rollback(&pending.snapshot, pending.written_version, |current, snapshot| {
                match operation {
                    Operation::Create => current.iter().filter(|r| r.id != key).cloned().collect(),
                    Operation::Update | Operation::Toggle => {
                        let Some(original) = snapshot.find(key) else {
                            return current.to_vec();
                        };
                        current
                            .iter()
                            .map(|r| if r.id == key { original.clone() } else { r.clone() })
                            .collect()
                    }
                    Operation::Delete => {
                        let mut next = current.to_vec();
                        if next.iter().any(|r| r.id == key) {
                            return next;
                        }
                        if let Some(index) = snapshot.iter().position(|r| r.id == key) {
                            next.insert(index.min(next.len()), snapshot[index].clone());
                        }
                        next
                    }
                }
            });
        debug!(operation = operation.as_str(), id = key, "provisional state rolled back");
    }

    fn report(&self, operation: &str, id: Option<i64>, err: &Error) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let mut context = serde_json::Map::new();
        context.insert("operation".to_string(), operation.into());
        if let Some(id) = id {
            context.insert("id".to_string(), id.into());
        }
        telemetry.record_detached(ReportedError::from(err), err.source_tag(), Some(context));
    }
}

/// Replaces the record with `id` by `edit(record)`, keeping its position.
fn replace_record<F>(records: &[Directory], id: i64, edit: F) -> Result<Vec<Directory>, Error>
where
    F: FnOnce(&Directory) -> Directory,
{
    let index = records
        .iter()
        .position(|record| record.id == id)
        .ok_or(Error::NotFound(id))?;
    let mut next = records.to_vec();
    next[index] = edit(&records[index]);
    Ok(next)
}
