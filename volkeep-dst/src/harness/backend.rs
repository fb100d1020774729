//! Recording backend and the oracles that check its log.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tonic::{Code, Status};
use volkeep_csi::config::BackendConfig;
use volkeep_csi::{Backend, CallContext, MemoryBackend};

use super::SimulationError;

/// Backend operation, with the arguments the oracle needs to replay it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    Create { min_bytes: i64 },
    Delete,
    Check,
}

/// What a backend call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created(i64),
    Deleted,
    Exists,
    Failed(Code),
    /// Fault injected before the call reached the store.
    Injected,
}

/// One backend call. `start` and `end` are ticks of a logical clock shared by
/// every call, so two records overlap exactly when their ticks interleave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub name: String,
    pub op: BackendOp,
    pub start: u64,
    pub end: u64,
    pub outcome: Outcome,
}

impl CallRecord {
    fn overlaps(&self, other: &CallRecord) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// [`MemoryBackend`] wrapped with a call log, random yields inside each call
/// and optional fault injection.
pub struct SimBackend {
    inner: MemoryBackend,
    clock: AtomicU64,
    log: Mutex<Vec<CallRecord>>,
    rng: Mutex<SmallRng>,
    /// Percentage of calls that fail with `UNAVAILABLE` before touching the
    /// store.
    fault_percent: u32,
}

impl SimBackend {
    pub fn new(seed: u64, config: BackendConfig, fault_percent: u32) -> Self {
        Self {
            inner: MemoryBackend::new(config),
            clock: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            fault_percent,
        }
    }

    /// Copy of the log so far, in call start order.
    pub fn log(&self) -> Vec<CallRecord> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner()).clone();
        log.sort_by_key(|r| r.start);
        log
    }

    pub fn call_count(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Draw how many times to yield and whether to inject a fault.
    fn draw(&self) -> (u32, bool) {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let yields = rng.random_range(0..4);
        let fault = rng.random_range(0..100) < self.fault_percent;
        (yields, fault)
    }

    async fn yield_times(n: u32) {
        for _ in 0..n {
            tokio::task::yield_now().await;
        }
    }

    async fn recorded<T, F>(
        &self,
        name: &str,
        op: BackendOp,
        call: F,
        outcome_of: fn(&T) -> Outcome,
    ) -> Result<T, Status>
    where
        F: std::future::Future<Output = Result<T, Status>>,
    {
        let start = self.tick();
        let (yields, fault) = self.draw();
        Self::yield_times(yields).await;

        let (result, outcome) = if fault {
            (Err(Status::unavailable("injected fault")), Outcome::Injected)
        } else {
            let result = call.await;
            let outcome = match &result {
                Ok(value) => outcome_of(value),
                Err(status) => Outcome::Failed(status.code()),
            };
            (result, outcome)
        };

        Self::yield_times(yields).await;
        let end = self.tick();
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(CallRecord {
                name: name.to_string(),
                op,
                start,
                end,
                outcome,
            });
        result
    }
}

#[tonic::async_trait]
impl Backend for SimBackend {
    async fn create_volume(
        &self,
        ctx: &CallContext,
        name: &str,
        min_bytes: i64,
    ) -> Result<i64, Status> {
        self.recorded(
            name,
            BackendOp::Create { min_bytes },
            self.inner.create_volume(ctx, name, min_bytes),
            |size| Outcome::Created(*size),
        )
        .await
    }

    async fn delete_volume(&self, ctx: &CallContext, name: &str) -> Result<(), Status> {
        self.recorded(
            name,
            BackendOp::Delete,
            self.inner.delete_volume(ctx, name),
            |_| Outcome::Deleted,
        )
        .await
    }

    async fn check_volume_exists(&self, ctx: &CallContext, id: &str) -> Result<(), Status> {
        self.recorded(
            id,
            BackendOp::Check,
            self.inner.check_volume_exists(ctx, id),
            |_| Outcome::Exists,
        )
        .await
    }
}

/// Checks that calls for the same name never overlap in time.
pub struct IntervalOracle;

impl IntervalOracle {
    pub fn check(log: &[CallRecord]) -> Result<(), SimulationError> {
        let mut by_name: HashMap<&str, Vec<&CallRecord>> = HashMap::new();
        for record in log {
            by_name.entry(&record.name).or_default().push(record);
        }

        for (name, mut records) in by_name {
            records.sort_by_key(|r| r.start);
            for pair in records.windows(2) {
                if pair[0].overlaps(pair[1]) {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "overlapping calls on {name}: {:?} [{}, {}] and {:?} [{}, {}]",
                            pair[0].op,
                            pair[0].start,
                            pair[0].end,
                            pair[1].op,
                            pair[1].start,
                            pair[1].end
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Model of the memory backend, replayed against the call log.
///
/// Calls on one name are serialized, so replaying in start order reproduces
/// the exact sequence each name went through.
pub struct BackendOracle {
    config: BackendConfig,
    volumes: HashMap<String, i64>,
}

impl BackendOracle {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            volumes: HashMap::new(),
        }
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    fn allocation(&self, min_bytes: i64) -> i64 {
        if min_bytes == 0 {
            return self.config.default_volume_bytes;
        }
        let unit = self.config.allocation_unit_bytes;
        (min_bytes + unit - 1) / unit * unit
    }

    /// Predict the outcome of `op` and update the model.
    fn apply(&mut self, name: &str, op: BackendOp) -> Outcome {
        match op {
            BackendOp::Create { min_bytes } => match self.volumes.get(name) {
                Some(&existing) if existing >= min_bytes => Outcome::Created(existing),
                Some(_) => Outcome::Failed(Code::AlreadyExists),
                None => {
                    let size = self.allocation(min_bytes);
                    self.volumes.insert(name.to_string(), size);
                    Outcome::Created(size)
                }
            },
            BackendOp::Delete => {
                self.volumes.remove(name);
                Outcome::Deleted
            }
            BackendOp::Check => {
                if self.volumes.contains_key(name) {
                    Outcome::Exists
                } else {
                    Outcome::Failed(Code::NotFound)
                }
            }
        }
    }

    /// Replay `log` (in start order) and compare every outcome.
    pub fn replay(&mut self, log: &[CallRecord]) -> Result<(), SimulationError> {
        for record in log {
            if record.outcome == Outcome::Injected {
                continue;
            }
            let expected = self.apply(&record.name, record.op);
            if expected != record.outcome {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "{:?} on {} at tick {}: expected {:?}, got {:?}",
                        record.op, record.name, record.start, expected, record.outcome
                    ),
                });
            }
        }
        Ok(())
    }
}
