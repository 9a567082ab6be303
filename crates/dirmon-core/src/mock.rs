//! In-memory directory API for tests and offline runs.
//!
//! `MockClient` behaves like the real server (id assignment, 404s, duplicate
//! path conflicts, toggle semantics) and adds knobs for scripted failures and
//! per-call latency, so tests can hold a call in flight while observing the
//! cache.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;

use crate::client::RemoteResourceClient;
use crate::error::Error;
use crate::model::{DEFAULT_ACTOR, Directory, DirectoryCreate, DirectoryUpdate};
use crate::telemetry::ErrorEntry;

/// Operation kinds, for failure scripting and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    List,
    Get,
    Create,
    Replace,
    Toggle,
    Delete,
    SubmitErrors,
}

struct MockState {
    records: Vec<Directory>,
    next_id: i64,
    failures: HashMap<MockOp, VecDeque<Error>>,
    latency: HashMap<MockOp, Duration>,
    record_latency: HashMap<i64, Duration>,
    calls: HashMap<MockOp, usize>,
    batches: Vec<Vec<ErrorEntry>>,
}

impl MockState {
    fn fail(&mut self, op: MockOp) -> Result<(), Error> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn find_mut(&mut self, id: i64) -> Result<&mut Directory, Error> {
        self.records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(Error::NotFound(id))
    }

    fn path_taken(&self, path: &str, except: Option<i64>) -> bool {
        self.records
            .iter()
            .any(|record| record.directory_path == path && Some(record.id) != except)
    }
}

fn conflict(path: &str) -> Error {
    Error::Server {
        status: 409,
        body: format!("{{\"detail\":\"directory '{}' is already registered\"}}", path),
    }
}

/// In-memory `RemoteResourceClient`.
pub struct MockClient {
    state: Mutex<MockState>,
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    /// Creates a server already holding `records`.
    pub fn with_records(records: Vec<Directory>) -> Self {
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        Self {
            state: Mutex::new(MockState {
                records,
                next_id,
                failures: HashMap::new(),
                latency: HashMap::new(),
                record_latency: HashMap::new(),
                calls: HashMap::new(),
                batches: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Id the next created record receives.
    pub fn set_next_id(&self, id: i64) {
        self.lock().next_id = id;
    }

    /// Makes the next call of `op` to complete fail with `error`.
    /// Calls queue up: each scripted failure is consumed once.
    pub fn fail_next(&self, op: MockOp, error: Error) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Delays every call of `op` by `latency`.
    pub fn set_latency(&self, op: MockOp, latency: Duration) {
        self.lock().latency.insert(op, latency);
    }

    /// Delays every call targeting record `id`. Takes precedence over
    /// per-operation latency.
    pub fn set_record_latency(&self, id: i64, latency: Duration) {
        self.lock().record_latency.insert(id, latency);
    }

    /// Server-side records.
    pub fn records(&self) -> Vec<Directory> {
        self.lock().records.clone()
    }

    /// Error batches received so far, in arrival order.
    pub fn submitted_batches(&self) -> Vec<Vec<ErrorEntry>> {
        self.lock().batches.clone()
    }

    /// Number of calls of `op` started so far.
    pub fn call_count(&self, op: MockOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn begin(&self, op: MockOp, id: Option<i64>) -> Duration {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        id.and_then(|id| state.record_latency.get(&id).copied())
            .or_else(|| state.latency.get(&op).copied())
            .unwrap_or(Duration::ZERO)
    }
}

/// Suspends like a network round-trip would.
async fn round_trip(latency: Duration) {
    if latency.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(latency).await;
    }
}

impl RemoteResourceClient for MockClient {
    async fn list(&self) -> Result<Vec<Directory>, Error> {
        round_trip(self.begin(MockOp::List, None)).await;
        let mut state = self.lock();
        state.fail(MockOp::List)?;
        Ok(state.records.clone())
    }

    async fn get(&self, id: i64) -> Result<Directory, Error> {
        round_trip(self.begin(MockOp::Get, Some(id))).await;
        let mut state = self.lock();
        state.fail(MockOp::Get)?;
        state.find_mut(id).map(|record| record.clone())
    }

    async fn create(&self, input: &DirectoryCreate) -> Result<Directory, Error> {
        round_trip(self.begin(MockOp::Create, None)).await;
        let mut state = self.lock();
        state.fail(MockOp::Create)?;
        input.validate()?;
        if state.path_taken(&input.directory_path, None) {
            return Err(conflict(&input.directory_path));
        }

        let id = state.next_id;
        state.next_id += 1;
        let mut record = Directory::provisional(id, input, Utc::now());
        record.updated_by = record.created_by.clone();
        state.records.push(record.clone());
        Ok(record)
    }

    async fn replace(&self, id: i64, input: &DirectoryUpdate) -> Result<Directory, Error> {
        round_trip(self.begin(MockOp::Replace, Some(id))).await;
        let mut state = self.lock();
        state.fail(MockOp::Replace)?;
        input.validate()?;
        if let Some(path) = &input.directory_path {
            if state.path_taken(path, Some(id)) {
                return Err(conflict(path));
            }
        }

        let record = state.find_mut(id)?;
        let mut merged = input.apply_to(record, Utc::now());
        if input.updated_by.is_none() {
            merged.updated_by = DEFAULT_ACTOR.to_string();
        }
        *record = merged.clone();
        Ok(merged)
    }

    async fn toggle(&self, id: i64) -> Result<Directory, Error> {
        round_trip(self.begin(MockOp::Toggle, Some(id))).await;
        let mut state = self.lock();
        state.fail(MockOp::Toggle)?;
        let record = state.find_mut(id)?;
        record.enabled = !record.enabled;
        record.updated_at = Utc::now();
        record.updated_by = DEFAULT_ACTOR.to_string();
        Ok(record.clone())
    }

    async fn delete(&self, id: i64) -> Result<(), Error> {
        round_trip(self.begin(MockOp::Delete, Some(id))).await;
        let mut state = self.lock();
        state.fail(MockOp::Delete)?;
        let before = state.records.len();
        state.records.retain(|record| record.id != id);
        if state.records.len() == before {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    async fn submit_error_batch(&self, entries: &[ErrorEntry]) -> Result<(), Error> {
        round_trip(self.begin(MockOp::SubmitErrors, None)).await;
        let mut state = self.lock();
        state.fail(MockOp::SubmitErrors)?;
        state.batches.push(entries.to_vec());
        Ok(())
    }
}
