//! Volume capability checks.
//!
//! Only filesystem (mount) volumes are served, and only in access modes that
//! never have more than one writer attached. CreateVolume fails on the first
//! unsupported capability; ValidateVolumeCapabilities instead reports which
//! capabilities it can confirm.

use thiserror::Error;

use crate::csi::VolumeCapability;
use crate::csi::volume_capability::AccessType;
use crate::csi::volume_capability::access_mode::Mode;

/// A capability this plugin recognizes but does not support.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Block Volume not supported")]
    BlockUnsupported,

    #[error("multi-node reader, single writer not supported")]
    MultiNodeSingleWriter,

    #[error("multi-node reader, multi-node writer not supported")]
    MultiNodeMultiWriter,

    /// Any other access mode, by CSI name (or numeric value if unnamed).
    #[error("{0} not supported")]
    UnsupportedMode(String),
}

impl From<Rejection> for tonic::Status {
    fn from(rejection: Rejection) -> Self {
        crate::Error::from(rejection).into()
    }
}

/// Result of checking capabilities against an existing volume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Confirmation {
    /// Supported capabilities, in request order.
    pub accepted: Vec<VolumeCapability>,
    /// Set when a capability ruled out confirmation entirely.
    pub rejection: Option<Rejection>,
}

impl Confirmation {
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

enum ModeCheck {
    Supported,
    Rejected(Rejection),
    Unsupported(String),
}

fn check_mode(cap: &VolumeCapability) -> ModeCheck {
    let raw = cap.access_mode.as_ref().map_or(0, |m| m.mode);
    match Mode::try_from(raw) {
        Ok(Mode::SingleNodeWriter | Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly) => {
            ModeCheck::Supported
        }
        Ok(Mode::MultiNodeSingleWriter) => ModeCheck::Rejected(Rejection::MultiNodeSingleWriter),
        Ok(Mode::MultiNodeMultiWriter) => ModeCheck::Rejected(Rejection::MultiNodeMultiWriter),
        Ok(Mode::Unknown) => ModeCheck::Unsupported(Mode::Unknown.as_str_name().to_string()),
        Err(_) => ModeCheck::Unsupported(raw.to_string()),
    }
}

/// Check capabilities for CreateVolume, stopping at the first unsupported
/// one.
pub fn validate_for_create(caps: &[VolumeCapability]) -> Result<(), Rejection> {
    for cap in caps {
        if matches!(cap.access_type, Some(AccessType::Block(_))) {
            return Err(Rejection::BlockUnsupported);
        }
        match check_mode(cap) {
            ModeCheck::Supported => {}
            ModeCheck::Rejected(rejection) => return Err(rejection),
            ModeCheck::Unsupported(name) => return Err(Rejection::UnsupportedMode(name)),
        }
    }
    Ok(())
}

/// Work out which capabilities can be confirmed for an existing volume.
///
/// Block and multi-writer capabilities reject the whole request. Capabilities
/// without a mount access type, or with an unrecognized mode, are left out of
/// the accepted set without failing it.
pub fn confirm(caps: &[VolumeCapability]) -> Confirmation {
    let mut accepted = Vec::with_capacity(caps.len());
    for cap in caps {
        match cap.access_type {
            Some(AccessType::Block(_)) => return rejected(Rejection::BlockUnsupported),
            Some(AccessType::Mount(_)) => {}
            None => continue,
        }
        match check_mode(cap) {
            ModeCheck::Supported => accepted.push(cap.clone()),
            ModeCheck::Rejected(rejection) => return rejected(rejection),
            ModeCheck::Unsupported(_) => {}
        }
    }
    Confirmation {
        accepted,
        rejection: None,
    }
}

fn rejected(rejection: Rejection) -> Confirmation {
    Confirmation {
        accepted: Vec::new(),
        rejection: Some(rejection),
    }
}
