use thiserror::Error;

use crate::manager::ManagerId;
use crate::registry::{AttrId, NotFound};
use crate::session::{PeerId, PeripheralState};

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// A native stack refused a request before it reached the radio.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    #[error("peripheral not found: {0}")]
    PeerNotFound(PeerId),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("native request failed with status {status}")]
    Failed { status: i32 },
}

/// Synchronous rejection of a bridge request. No event follows one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("unknown central manager: {0}")]
    UnknownManager(ManagerId),

    #[error("malformed peer identity: {0:?}")]
    InvalidPeerId(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("peer not connected: {0}")]
    NotConnected(PeerId),

    #[error("peer {peer} cannot do that while {state:?}")]
    InvalidState { peer: PeerId, state: PeripheralState },

    #[error("central manager is already scanning")]
    AlreadyScanning,

    #[error("invalid attribute handle: {0}")]
    InvalidHandle(AttrId),

    #[error(transparent)]
    Native(#[from] NativeError),

    #[error("bridge is shut down")]
    Closed,
}

impl BridgeError {
    /// Negative status reported across the boundary for this rejection.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::UnknownManager(_) => -1,
            BridgeError::InvalidPeerId(_) => -2,
            BridgeError::UnknownPeer(_) => -3,
            BridgeError::NotConnected(_) => -4,
            BridgeError::InvalidState { .. } => -5,
            BridgeError::AlreadyScanning => -6,
            BridgeError::InvalidHandle(_) => -7,
            BridgeError::Native(_) => -8,
            BridgeError::Closed => -9,
        }
    }
}

impl From<NotFound> for BridgeError {
    fn from(err: NotFound) -> Self {
        BridgeError::InvalidHandle(err.0)
    }
}

/// `0` when the request was accepted, the rejection's negative code otherwise.
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_distinct_negative_codes() {
        let peer: PeerId = "5e9a1c1e-7a8c-4a1e-9d3c-2b1f0e6a9c11".parse().unwrap();
        let errors = vec![
            BridgeError::UnknownManager(ManagerId::from_raw(1)),
            BridgeError::InvalidPeerId("nope".into()),
            BridgeError::UnknownPeer(peer),
            BridgeError::NotConnected(peer),
            BridgeError::InvalidState {
                peer,
                state: PeripheralState::Connected,
            },
            BridgeError::AlreadyScanning,
            BridgeError::InvalidHandle(AttrId::from_raw(3)),
            BridgeError::Native(NativeError::NotSupported("mtu".into())),
            BridgeError::Closed,
        ];

        let mut codes: Vec<i32> = errors.iter().map(BridgeError::code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn not_found_becomes_invalid_handle() {
        let err: BridgeError = NotFound(AttrId::from_raw(7)).into();

        assert_eq!(err, BridgeError::InvalidHandle(AttrId::from_raw(7)));
        assert_eq!(status_code::<()>(&Err(err)), -7);
        assert_eq!(status_code(&Ok(())), 0);
    }
}
