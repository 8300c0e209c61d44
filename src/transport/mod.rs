//! Transport capability for pulling raw force-plate frames.
//!
//! The acquisition loop only depends on the [`Transport`] trait; the
//! concrete TCP client lives in [`tcp`].

pub mod tcp;
pub mod types;

pub use tcp::TcpTransport;
pub use types::{FetchError, Payload, RawFrame, FORCE_KEY};

/// Source of raw sensor frames.
///
/// Every call is synchronous. A returned error is treated as transient by the
/// caller and may be retried; a payload without the requested key is "no data".
pub trait Transport {
    fn fetch(&mut self, command: &[String]) -> Result<Payload, FetchError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn fetch(&mut self, command: &[String]) -> Result<Payload, FetchError> {
        (**self).fetch(command)
    }
}
