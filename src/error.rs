use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An exceptional outcome stored in a future by `report_exception`.
///
/// Cheap to clone: every consumer that touches the result gets the same
/// underlying error back.
#[derive(Clone, thiserror::Error)]
#[error(transparent)]
pub struct Exception(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Exception {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Wraps a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Converts a caught panic payload into an exception.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self::new(PanicError(message))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns true if both exceptions share the same stored error.
    pub fn ptr_eq(&self, other: &Exception) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Exception").field(&self.0).finish()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// A continuation or pool task panicked; the panic message is kept.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task panicked: {0}")]
pub struct PanicError(pub String);

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The producer stored an exception; surfaced on every result access.
    #[error(transparent)]
    Exception(#[from] Exception),
    #[error("the future was canceled")]
    Canceled,
    /// The producer was dropped before it reported `Finished`.
    #[error("producer was dropped without finishing")]
    ProducerDropped,
    #[error("no result at index {0}")]
    NoResult(usize),
}
