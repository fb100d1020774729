//! Controller-level simulation harness.
//!
//! Each step samples a batch of random requests, runs them concurrently
//! against a [`ControllerService`] backed by a [`SimBackend`], and checks:
//! - every response code is one the request allows
//! - requests rejected by validation never reach the backend
//! - backend calls for the same name never overlap
//! - replaying the backend log against the model gives the same outcomes
//! - no volume lock is left behind

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tonic::{Code, Request};
use volkeep_csi::config::{BYTES_PER_MIB, BackendConfig, Config};
use volkeep_csi::controller::ControllerService;
use volkeep_csi::csi;
use volkeep_csi::csi::controller_server::Controller;
use volkeep_csi::csi::volume_capability::access_mode::Mode;
use volkeep_csi::csi::volume_capability::{AccessMode, AccessType, BlockVolume, MountVolume};
use volkeep_csi::driver::DriverState;

use super::SimulationError;
use super::backend::{BackendOracle, IntervalOracle, SimBackend};

/// Mode value outside the CSI enum.
const UNNAMED_MODE: i32 = 42;

/// Requests the harness can send.
#[derive(Debug, Clone)]
pub enum ControllerAction {
    Create {
        name: String,
        required_bytes: i64,
        caps: Vec<csi::VolumeCapability>,
    },
    Delete {
        name: String,
    },
    Validate {
        name: String,
        caps: Vec<csi::VolumeCapability>,
    },
}

impl ControllerAction {
    /// Code the controller must return before touching the backend, if any.
    fn expected_rejection(&self) -> Option<Code> {
        match self {
            Self::Create { name, caps, .. } => {
                if name.is_empty() || caps.is_empty() {
                    return Some(Code::InvalidArgument);
                }
                caps.iter()
                    .any(|cap| is_block(cap) || !is_supported_mode(cap))
                    .then_some(Code::Unimplemented)
            }
            Self::Delete { name } => name.is_empty().then_some(Code::InvalidArgument),
            Self::Validate { name, caps } => {
                (name.is_empty() || caps.is_empty()).then_some(Code::InvalidArgument)
            }
        }
    }

    fn execute(
        self,
        service: Arc<ControllerService>,
    ) -> impl std::future::Future<Output = ActionResult> + Send {
        async move {
            match self {
                Self::Create {
                    name,
                    required_bytes,
                    caps,
                } => {
                    let request = csi::CreateVolumeRequest {
                        name,
                        capacity_range: Some(csi::CapacityRange {
                            required_bytes,
                            limit_bytes: 0,
                        }),
                        volume_capabilities: caps,
                        parameters: HashMap::new(),
                        secrets: HashMap::new(),
                        volume_content_source: None,
                        accessibility_requirements: None,
                    };
                    match service.create_volume(Request::new(request)).await {
                        Ok(_) => ActionResult::Ok { confirmed: None },
                        Err(status) => ActionResult::Err(status.code()),
                    }
                }
                Self::Delete { name } => {
                    let request = csi::DeleteVolumeRequest {
                        volume_id: name,
                        secrets: HashMap::new(),
                    };
                    match service.delete_volume(Request::new(request)).await {
                        Ok(_) => ActionResult::Ok { confirmed: None },
                        Err(status) => ActionResult::Err(status.code()),
                    }
                }
                Self::Validate { name, caps } => {
                    let request = csi::ValidateVolumeCapabilitiesRequest {
                        volume_id: name,
                        volume_context: HashMap::new(),
                        volume_capabilities: caps,
                        parameters: HashMap::new(),
                        secrets: HashMap::new(),
                    };
                    match service.validate_volume_capabilities(Request::new(request)).await {
                        Ok(response) => ActionResult::Ok {
                            confirmed: Some(response.into_inner().confirmed.is_some()),
                        },
                        Err(status) => ActionResult::Err(status.code()),
                    }
                }
            }
        }
    }
}

/// Condensed response. `confirmed` is set for ValidateVolumeCapabilities only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionResult {
    Ok { confirmed: Option<bool> },
    Err(Code),
}

fn is_block(cap: &csi::VolumeCapability) -> bool {
    matches!(cap.access_type, Some(AccessType::Block(_)))
}

fn is_supported_mode(cap: &csi::VolumeCapability) -> bool {
    let mode = cap.access_mode.as_ref().map_or(0, |m| m.mode);
    [
        Mode::SingleNodeWriter,
        Mode::SingleNodeReaderOnly,
        Mode::MultiNodeReaderOnly,
    ]
    .iter()
    .any(|m| *m as i32 == mode)
}

fn is_multi_writer(cap: &csi::VolumeCapability) -> bool {
    let mode = cap.access_mode.as_ref().map_or(0, |m| m.mode);
    mode == Mode::MultiNodeSingleWriter as i32 || mode == Mode::MultiNodeMultiWriter as i32
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct ControllerStats {
    pub operations: u64,
    pub batches: u64,
    pub creates: u64,
    pub deletes: u64,
    pub validates: u64,
    pub rejected: u64,
    pub backend_calls: u64,
}

/// Controller simulation harness.
pub struct ControllerHarness {
    rng: SmallRng,
    service: Arc<ControllerService>,
    state: Arc<DriverState>,
    backend: Arc<SimBackend>,
    oracle: BackendOracle,
    names: Vec<String>,
    /// Backend log entries already replayed.
    replayed: usize,
    stats: ControllerStats,
}

impl ControllerHarness {
    pub fn new(
        seed: u64,
        volume_count: usize,
        fault_percent: u32,
    ) -> Result<Self, SimulationError> {
        let backend_config = BackendConfig::default();
        let backend = Arc::new(SimBackend::new(
            seed.wrapping_add(1),
            backend_config.clone(),
            fault_percent,
        ));
        let config = Config {
            backend: backend_config.clone(),
            ..Default::default()
        };
        let state = DriverState::new(config, backend.clone())
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let state = Arc::new(state);

        Ok(Self {
            rng: SmallRng::seed_from_u64(seed),
            service: Arc::new(ControllerService::new(state.clone())),
            state,
            backend,
            oracle: BackendOracle::new(backend_config),
            names: (0..volume_count).map(|i| format!("vol-{i}")).collect(),
            replayed: 0,
            stats: ControllerStats::default(),
        })
    }

    /// Run `operations` requests in batches of up to `batch_size`.
    pub async fn run(
        &mut self,
        operations: u64,
        batch_size: usize,
    ) -> Result<(), SimulationError> {
        let mut remaining = operations;
        while remaining > 0 {
            let n = remaining.min(batch_size.max(1) as u64);
            let batch: Vec<_> = (0..n).map(|_| self.sample_action()).collect();
            self.execute_batch(batch).await?;
            remaining -= n;
        }
        Ok(())
    }

    /// Run one batch concurrently and check every invariant afterwards.
    pub async fn execute_batch(
        &mut self,
        batch: Vec<ControllerAction>,
    ) -> Result<(), SimulationError> {
        let calls_before = self.backend.call_count();
        let mut expected_calls = 0;

        let mut tasks = Vec::with_capacity(batch.len());
        for action in batch {
            match &action {
                ControllerAction::Create { .. } => self.stats.creates += 1,
                ControllerAction::Delete { .. } => self.stats.deletes += 1,
                ControllerAction::Validate { .. } => self.stats.validates += 1,
            }
            if action.expected_rejection().is_none() {
                expected_calls += 1;
            }
            let future = action.clone().execute(self.service.clone());
            tasks.push((action, tokio::spawn(future)));
        }

        for (action, task) in tasks {
            let result = task
                .await
                .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
            self.check_result(&action, result)?;
            self.stats.operations += 1;
        }
        self.stats.batches += 1;

        let calls = self.backend.call_count() - calls_before;
        self.stats.backend_calls += calls as u64;
        if calls != expected_calls {
            return Err(SimulationError::Mismatch {
                context: format!("backend calls: expected {expected_calls}, got {calls}"),
            });
        }

        self.validate_invariants()
    }

    fn check_result(
        &mut self,
        action: &ControllerAction,
        result: ActionResult,
    ) -> Result<(), SimulationError> {
        if let Some(code) = action.expected_rejection() {
            self.stats.rejected += 1;
            if result != ActionResult::Err(code) {
                return Err(SimulationError::Mismatch {
                    context: format!("{action:?}: expected {code:?}, got {result:?}"),
                });
            }
            return Ok(());
        }

        let allowed: &[Code] = match action {
            ControllerAction::Create { .. } => &[Code::AlreadyExists, Code::Unavailable],
            ControllerAction::Delete { .. } => &[Code::Unavailable],
            ControllerAction::Validate { .. } => &[Code::NotFound, Code::Unavailable],
        };
        match result {
            ActionResult::Err(code) if !allowed.contains(&code) => Err(SimulationError::Mismatch {
                context: format!("{action:?}: unexpected code {code:?}"),
            }),
            ActionResult::Ok {
                confirmed: Some(confirmed),
            } => {
                let ControllerAction::Validate { caps, .. } = action else {
                    return Ok(());
                };
                let rejected = caps.iter().any(|c| is_block(c) || is_multi_writer(c));
                if confirmed == rejected {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "{action:?}: confirmed={confirmed}, expected {}",
                            !rejected
                        ),
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn validate_invariants(&mut self) -> Result<(), SimulationError> {
        let log = self.backend.log();
        IntervalOracle::check(&log)?;
        self.oracle.replay(&log[self.replayed..])?;
        self.replayed = log.len();

        if !self.state.locks().is_empty() {
            return Err(SimulationError::Mismatch {
                context: format!("{} volume locks left behind", self.state.locks().len()),
            });
        }
        Ok(())
    }

    fn sample_name(&mut self) -> String {
        if self.rng.random_range(0..100) < 3 {
            return String::new();
        }
        let idx = self.rng.random_range(0..self.names.len());
        self.names[idx].clone()
    }

    fn sample_capability(&mut self) -> csi::VolumeCapability {
        let access_type = if self.rng.random_range(0..100) < 15 {
            AccessType::Block(BlockVolume {})
        } else {
            AccessType::Mount(MountVolume {
                fs_type: "ext4".to_string(),
                mount_flags: vec![],
            })
        };
        // Weighted toward the supported modes.
        let mode = match self.rng.random_range(0..20) {
            0..6 => Mode::SingleNodeWriter as i32,
            6..10 => Mode::SingleNodeReaderOnly as i32,
            10..14 => Mode::MultiNodeReaderOnly as i32,
            14..16 => Mode::MultiNodeSingleWriter as i32,
            16..18 => Mode::MultiNodeMultiWriter as i32,
            18 => Mode::Unknown as i32,
            _ => UNNAMED_MODE,
        };
        csi::VolumeCapability {
            access_type: Some(access_type),
            access_mode: Some(AccessMode { mode }),
        }
    }

    fn sample_capabilities(&mut self) -> Vec<csi::VolumeCapability> {
        let count = match self.rng.random_range(0..20) {
            0 => 0,
            1..14 => 1,
            14..18 => 2,
            _ => 3,
        };
        (0..count).map(|_| self.sample_capability()).collect()
    }

    fn sample_action(&mut self) -> ControllerAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..45 => {
                let required_bytes = match self.rng.random_range(0..4) {
                    0 => 0,
                    _ => self.rng.random_range(1..=8 * BYTES_PER_MIB),
                };
                ControllerAction::Create {
                    name: self.sample_name(),
                    required_bytes,
                    caps: self.sample_capabilities(),
                }
            }
            45..70 => ControllerAction::Delete {
                name: self.sample_name(),
            },
            _ => ControllerAction::Validate {
                name: self.sample_name(),
                caps: self.sample_capabilities(),
            },
        }
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }
}
