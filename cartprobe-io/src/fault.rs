//! Failure classes shared by every layer of the harness.
//!
//! Faults travel inside [`eyre::Report`]s, either as the root error or as a
//! context layer added with `wrap_err`. [`FaultExt::fault`] recovers the class.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// Adapter I/O failure or protocol desync. The session must be torn down.
    #[error("communication fault: {0}")]
    Communication(String),
    /// The unit is unusable or further testing is unsafe.
    #[error("critical failure: {0}")]
    Critical(String),
    /// A single check failed; the session is still usable.
    #[error("recoverable failure: {0}")]
    Recoverable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FaultKind {
    Recoverable,
    Critical,
    Communication,
}

impl Fault {
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    pub fn critical(msg: impl Into<String>) -> Self {
        Self::Critical(msg.into())
    }

    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Communication(_) => FaultKind::Communication,
            Fault::Critical(_) => FaultKind::Critical,
            Fault::Recoverable(_) => FaultKind::Recoverable,
        }
    }
}

pub trait FaultExt {
    fn fault(&self) -> Option<&Fault>;

    fn fault_kind(&self) -> Option<FaultKind> {
        self.fault().map(Fault::kind)
    }
}

impl FaultExt for eyre::Report {
    fn fault(&self) -> Option<&Fault> {
        self.downcast_ref::<Fault>()
    }
}
