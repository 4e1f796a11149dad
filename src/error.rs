//! Error taxonomy for the particle container and the boundary kernels.
//!
//! Every error here is fatal for the running simulation: the library returns
//! it, the application layer wraps it with `anyhow` context and the binary
//! terminates with the message. The only soft condition in the core, a
//! particle with no nearby boundary face, is not an error and is encoded as
//! `None` in the kernel outputs.

use std::collections::TryReserveError;
use std::fmt;

/// Failures of the particle container.
#[derive(Debug)]
pub enum ContainerError {
    /// The backing storage could not grow to the requested number of slots.
    Allocation {
        requested: usize,
        source: Option<TryReserveError>,
    },
    /// A live particle received no destination during a rebuild.
    Unassigned { slot: usize, id: u64 },
    /// A destination or seed referenced an element the container does not have.
    ElementOutOfRange { element: usize, num_elems: usize },
    /// A per-slot input did not have one entry per slot.
    LengthMismatch { expected: usize, found: usize },
    /// Two particles share an id.
    DuplicateId(u64),
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::Allocation { requested, source } => match source {
                Some(e) => write!(f, "failed to allocate {} particle slots: {}", requested, e),
                None => write!(
                    f,
                    "failed to allocate {} particle slots: exceeds configured maximum capacity",
                    requested
                ),
            },
            ContainerError::Unassigned { slot, id } => write!(
                f,
                "live particle {} in slot {} has no destination for rebuild",
                id, slot
            ),
            ContainerError::ElementOutOfRange { element, num_elems } => write!(
                f,
                "element {} is out of range for a container over {} elements",
                element, num_elems
            ),
            ContainerError::LengthMismatch { expected, found } => write!(
                f,
                "expected {} per-slot entries, found {}",
                expected, found
            ),
            ContainerError::DuplicateId(id) => write!(f, "particle id {} is not unique", id),
        }
    }
}

impl std::error::Error for ContainerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ContainerError::Allocation {
                source: Some(e), ..
            } => Some(e),
            _ => None,
        }
    }
}

/// Broken invariants of a boundary face candidate list.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexError {
    /// `offsets[i + 1] < offsets[i]`.
    NonMonotonicOffsets { position: usize },
    /// The offsets do not start at zero.
    NonZeroStart(usize),
    /// The payload does not hold exactly `offsets.last() * stride` values.
    PayloadLength { expected: usize, found: usize },
    /// A face id or neighbour element header is not a non-negative integer.
    MalformedHeader { entry: usize, value: f64 },
    /// The candidate list covers a different number of elements than the mesh.
    ElementCount { expected: usize, found: usize },
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::NonMonotonicOffsets { position } => write!(
                f,
                "candidate offsets decrease between elements {} and {}",
                position,
                position + 1
            ),
            IndexError::NonZeroStart(first) => {
                write!(f, "candidate offsets start at {} instead of 0", first)
            }
            IndexError::PayloadLength { expected, found } => write!(
                f,
                "candidate payload holds {} values, offsets require {}",
                found, expected
            ),
            IndexError::MalformedHeader { entry, value } => write!(
                f,
                "candidate entry {} has a malformed header value {}",
                entry, value
            ),
            IndexError::ElementCount { expected, found } => write!(
                f,
                "candidate list covers {} elements, expected {}",
                found, expected
            ),
        }
    }
}

impl std::error::Error for IndexError {}

/// Fatal conditions detected inside a per-particle kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    /// The candidate range of an element was non-empty but no face was selected.
    NoFaceFound {
        element: usize,
        slot: usize,
        candidates: usize,
    },
    /// The candidate list does not fit the container it is applied to.
    Index(IndexError),
}

impl From<IndexError> for KernelError {
    fn from(e: IndexError) -> Self {
        KernelError::Index(e)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NoFaceFound {
                element,
                slot,
                candidates,
            } => write!(
                f,
                "no boundary face selected for slot {} in element {} despite {} candidates",
                slot, element, candidates
            ),
            KernelError::Index(e) => write!(f, "unusable boundary candidate list: {}", e),
        }
    }
}

impl std::error::Error for KernelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KernelError::Index(e) => Some(e),
            _ => None,
        }
    }
}
