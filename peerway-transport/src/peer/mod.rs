use std::fmt;
use std::sync::Arc;

pub mod queue;
pub mod reconnect;
pub(crate) mod runner;
pub(crate) mod state;

/// Opaque identifier of a remote peer. Short printable string, cheap to
/// clone and usable as a map key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: impl AsRef<str>) -> Self {
        PeerId(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId::new(id)
    }
}
