//! The transport abstraction (one-sided communication, collectives and active messages).
//!
//! Everything above this module talks to a [Comm], an `enum_dispatch` over the available
//! backends. Addresses handed to a backend are absolute addresses inside memory the
//! backend allocated (or registered) at the target unit.
use crate::config;
use crate::error::{DartError, DartResult};

use std::sync::Arc;

pub(crate) mod comm;
pub(crate) use comm::*;

pub(crate) mod local_transport;
use local_transport::fabric::LocalFabric;
use local_transport::LocalComm;

/// The list of available transport backends, used to specify how data is moved between units
#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Backend {
    /// All units are threads of the current process sharing one fabric
    Local,
}

impl Default for Backend {
    fn default() -> Self {
        match config().backend.as_str() {
            "local" => Backend::Local,
            other => {
                tracing::warn!("unknown backend {other:?}, falling back to local");
                Backend::Local
            }
        }
    }
}

/// Identifier of a registered active-message handler
pub(crate) type AmId = u8;

/// Active-message handler, invoked with the sending unit and the payload
pub(crate) type AmHandler = Arc<dyn Fn(usize, &[u8]) + Send + Sync>;

/// The members taking part in a collective, identified by a key all members agree on
#[derive(Debug, Clone)]
pub(crate) struct CollGroup {
    /// Key shared by every member, unique among the groups alive at the same time
    pub(crate) key: u64,
    /// Global unit ids of the members, in team order
    pub(crate) members: Arc<Vec<usize>>,
    /// Position of the calling unit in `members`
    pub(crate) my_index: usize,
}

impl CollGroup {
    pub(crate) fn size(&self) -> usize {
        self.members.len()
    }
}

/// Shared state a backend needs to create the transport endpoint of each unit
#[derive(Clone)]
pub(crate) enum TransportFabric {
    Local(Arc<LocalFabric>),
}

impl TransportFabric {
    pub(crate) fn new(backend: Backend, num_units: usize) -> DartResult<TransportFabric> {
        if num_units == 0 {
            return Err(DartError::Inval);
        }
        match backend {
            Backend::Local => Ok(TransportFabric::Local(Arc::new(LocalFabric::new(num_units)))),
        }
    }

    pub(crate) fn num_units(&self) -> usize {
        match self {
            TransportFabric::Local(fabric) => fabric.num_units(),
        }
    }

    /// Fail every unit blocked in the fabric
    pub(crate) fn abort(&self) {
        match self {
            TransportFabric::Local(fabric) => fabric.abort(),
        }
    }

    /// Create the endpoint for `unit`
    pub(crate) fn endpoint(&self, unit: usize) -> DartResult<Arc<Comm>> {
        if unit >= self.num_units() {
            return Err(DartError::Inval);
        }
        match self {
            TransportFabric::Local(fabric) => {
                Ok(Arc::new(LocalComm::new(unit, fabric.clone()).into()))
            }
        }
    }
}
