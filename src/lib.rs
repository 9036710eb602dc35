//! Attribute Protocol server ([Vol 3] Part F).
//!
//! A server-side implementation of the Bluetooth LE Attribute Protocol for a
//! single bearer. The server consumes request PDUs from an L2CAP channel,
//! resolves attributes in a local [`Db`], and writes exactly-framed response
//! PDUs back to the channel, enforcing the sequential request-response
//! discipline of [Vol 3] Part F, Section 3.3. Handle Value Notifications and
//! Indications are sent from [`Server::notify`] and [`Server::indicate`],
//! with the indication path blocking on the peer's confirmation.
//!
//! The L2CAP channel, the upper-layer attribute handlers, and connection
//! management are external collaborators reached through the [`Channel`] and
//! [`Io`] seams.

use std::fmt::{Debug, Display, Formatter};
use std::future::Future;

pub use {consts::*, db::*, handle::*, io::*, pdu::*, server::*, uuid::*};

mod consts;
mod db;
mod handle;
mod io;
mod pdu;
mod server;
mod uuid;

/// Error type returned by the ATT server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The channel receive MTU is outside of `DEFAULT_MTU..=MAX_MTU`.
    #[error("invalid MTU {0}")]
    InvalidMtu(u16),
    /// The peer failed to confirm an indication within the transaction
    /// timeout ([Vol 3] Part F, Section 3.3.3).
    #[error("sequential protocol timeout")]
    SeqProtoTimeout,
    /// The channel was closed while waiting for a confirmation.
    #[error("channel closed")]
    ClosedPipe,
    /// Channel I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Common ATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// PDU response result.
pub type RspResult<T> = std::result::Result<T, ErrorRsp>;

/// `ATT_ERROR_RSP` PDU ([Vol 3] Part F, Section 3.4.1.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub struct ErrorRsp {
    pub(crate) req: u8,
    pub(crate) hdl: Option<Handle>,
    pub(crate) err: ErrorCode,
}

impl ErrorRsp {
    /// Creates a new error response.
    #[inline(always)]
    #[must_use]
    pub(crate) const fn new(req: u8, hdl: Option<Handle>, err: ErrorCode) -> Self {
        Self { req, hdl, err }
    }

    /// Returns the error code.
    #[inline(always)]
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.err
    }
}

impl Display for ErrorRsp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use num_enum::TryFromPrimitive;
        f.write_str("ATT ")?;
        match Opcode::try_from_primitive(self.req) {
            Ok(op) => write!(f, "{op} "),
            Err(_) => write!(f, "request {:#04X} ", self.req),
        }?;
        if let Some(hdl) = self.hdl {
            write!(f, "for {hdl} ")?;
        }
        write!(f, "failed with {}", self.err)
    }
}

/// L2CAP channel interface consumed by the server. One whole PDU is
/// transferred per read or write call (packet boundaries are preserved by the
/// Basic L2CAP mode below this layer).
pub trait Channel: Debug + Send + Sync {
    /// Receives the next inbound PDU into `buf`, returning the PDU length.
    /// A return of `Ok(0)` indicates that the channel was torn down.
    fn read(&self, buf: &mut [u8]) -> impl Future<Output = std::io::Result<usize>> + Send;

    /// Sends one outbound PDU.
    fn write(&self, pdu: &[u8]) -> impl Future<Output = std::io::Result<usize>> + Send;

    /// Closes the channel. Pending reads must fail or return 0. May be called
    /// more than once.
    fn close(&self);

    /// Returns the maximum PDU size that can be received on this channel.
    fn rx_mtu(&self) -> u16;

    /// Applies a new transmit MTU negotiated via MTU exchange.
    fn set_tx_mtu(&self, mtu: u16);
}

/// Implements `Display` by calling into the `Debug` implementation.
macro_rules! impl_display_via_debug {
    ($($t:ty),* $(,)?) => {$(
        impl ::std::fmt::Display for $t {
            #[inline(always)]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Debug::fmt(self, f)
            }
        }
    )*};
}
pub(crate) use impl_display_via_debug;
