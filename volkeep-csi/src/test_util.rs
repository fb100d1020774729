//! Shared test utilities for controller tests.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Backend, MemoryBackend};
use crate::config::Config;
use crate::controller::ControllerService;
use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use crate::csi::volume_capability::{AccessMode, AccessType, BlockVolume, MountVolume};
use crate::driver::DriverState;
use crate::identity::IdentityService;

/// Test fixture providing isolated driver state for each test.
pub struct TestFixture {
    pub state: Arc<DriverState>,
    pub backend: Arc<MemoryBackend>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let backend = Arc::new(MemoryBackend::new(config.backend.clone()));
        let state = DriverState::new(config, backend.clone()).expect("valid test config");
        Self {
            state: Arc::new(state),
            backend,
        }
    }

    /// State wired to a caller-provided backend.
    pub fn state_with_backend(backend: Arc<dyn Backend>) -> Arc<DriverState> {
        Arc::new(DriverState::new(Config::default(), backend).expect("valid test config"))
    }

    pub fn identity_service(&self) -> IdentityService {
        IdentityService::new(Arc::clone(&self.state))
    }

    pub fn controller_service(&self) -> ControllerService {
        ControllerService::new(Arc::clone(&self.state))
    }
}

pub fn mount_cap(mode: Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(AccessType::Mount(MountVolume {
            fs_type: "ext4".to_string(),
            mount_flags: vec![],
        })),
        access_mode: Some(AccessMode { mode: mode as i32 }),
    }
}

pub fn block_cap(mode: Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(AccessType::Block(BlockVolume {})),
        access_mode: Some(AccessMode { mode: mode as i32 }),
    }
}

/// Mount capability with a mode value outside the known enum.
pub fn cap_with_raw_mode(mode: i32) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: mount_cap(Mode::SingleNodeWriter).access_type,
        access_mode: Some(AccessMode { mode }),
    }
}

pub fn create_request(name: &str, caps: Vec<csi::VolumeCapability>) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: None,
        volume_capabilities: caps,
        parameters: HashMap::new(),
        secrets: HashMap::new(),
        volume_content_source: None,
        accessibility_requirements: None,
    }
}
