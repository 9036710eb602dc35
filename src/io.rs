use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use structbuf::StructBuf;

use crate::{ErrorCode, Handle, Opcode, Uuid};

/// I/O callback result type.
pub type IoResult = std::result::Result<(), ErrorCode>;

/// Dynamic attribute I/O callback. The callback produces the attribute value
/// for reads and accepts the value for writes; any [`ErrorCode`] it returns
/// is propagated to the client in an error response (except for commands,
/// which never respond).
#[derive(Clone)]
#[repr(transparent)]
pub struct Io(Arc<dyn for<'a> Fn(IoReq<'a>) -> IoResult + Send + Sync>);

impl Io {
    /// Returns an I/O callback for a method of `T`.
    #[inline(always)]
    pub fn with<T: Send + Sync + 'static>(
        this: &Arc<T>,
        f: impl Fn(&T, IoReq) -> IoResult + Send + Sync + 'static,
    ) -> Self {
        let this = Arc::clone(this);
        Self(Arc::new(move |req: IoReq| f(&this, req)))
    }

    /// Executes the specified request.
    #[inline(always)]
    pub(crate) fn call(&self, req: IoReq) -> IoResult {
        (self.0)(req)
    }
}

impl Debug for Io {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_tuple("Io").field(&Arc::as_ptr(&self.0))).finish()
    }
}

impl<T: for<'a> Fn(IoReq<'a>) -> IoResult + Send + Sync + 'static> From<T> for Io {
    #[inline(always)]
    fn from(f: T) -> Self {
        Self(Arc::new(f))
    }
}

/// Dynamic attribute I/O request.
#[derive(Debug)]
#[non_exhaustive]
pub enum IoReq<'a> {
    Read(&'a mut ReadReq),
    Write(&'a WriteReq<'a>),
}

/// Attribute read request. The response buffer is capped at the remaining
/// payload budget of the pending response PDU; values exceeding the cap are
/// silently truncated.
#[derive(Debug)]
pub struct ReadReq {
    pub(crate) op: Opcode,
    pub(crate) hdl: Handle,
    pub(crate) typ: Option<Uuid>,
    pub(crate) off: u16,
    pub(crate) buf: StructBuf,
}

impl ReadReq {
    /// Creates a new read request with a response buffer capped at `lim`
    /// bytes.
    #[inline(always)]
    pub(crate) fn new(op: Opcode, lim: usize) -> Self {
        Self {
            op,
            hdl: Handle::MAX,
            typ: None,
            off: 0,
            buf: StructBuf::new(lim),
        }
    }

    /// Sets request parameters.
    #[inline(always)]
    pub(crate) fn with(&mut self, hdl: Handle, typ: Uuid, off: u16) -> &mut Self {
        self.hdl = hdl;
        self.typ = Some(typ);
        self.off = off;
        self.buf.clear();
        self
    }

    /// Returns the request opcode.
    #[inline(always)]
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.op
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the attribute type.
    #[inline(always)]
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.typ.expect("request parameters not set")
    }

    /// Returns the value offset. Non-zero only for `ATT_READ_BLOB_REQ`.
    #[inline(always)]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.off as _
    }

    /// Provides the complete attribute value with automatic offset handling.
    #[inline]
    pub fn complete(&mut self, v: impl AsRef<[u8]>) -> IoResult {
        self.partial((v.as_ref().get(self.offset()..)).ok_or(ErrorCode::InvalidOffset)?)
    }

    /// Provides the attribute value starting at the requested offset. The
    /// value is truncated to the response buffer cap.
    #[inline]
    pub fn partial(&mut self, v: impl AsRef<[u8]>) -> IoResult {
        let v = v.as_ref();
        self.buf.clear();
        self.buf.put_at(0, &v[..v.len().min(self.buf.lim())]);
        Ok(())
    }
}

/// Attribute write request.
#[derive(Debug)]
pub struct WriteReq<'a> {
    pub(crate) op: Opcode,
    pub(crate) hdl: Handle,
    pub(crate) val: &'a [u8],
}

impl<'a> WriteReq<'a> {
    /// Returns the request opcode.
    #[inline(always)]
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.op
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the value to be written.
    #[inline(always)]
    #[must_use]
    pub const fn value(&self) -> &'a [u8] {
        self.val
    }
}

impl<'a> AsRef<[u8]> for WriteReq<'a> {
    #[inline(always)]
    fn as_ref(&self) -> &'a [u8] {
        self.val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(lim: usize, off: u16) -> ReadReq {
        let mut r = ReadReq::new(Opcode::ReadReq, lim);
        r.with(
            Handle::new(1).unwrap(),
            crate::Uuid16::new(0x2A00).unwrap().as_uuid(),
            off,
        );
        r
    }

    #[test]
    fn under_cap() {
        let mut r = req(22, 0);
        r.partial(b"hello").unwrap();
        assert_eq!(r.buf.as_ref(), b"hello");
    }

    #[test]
    fn over_cap_truncates() {
        let mut r = req(4, 0);
        r.partial(b"hello world").unwrap();
        assert_eq!(r.buf.as_ref(), b"hell");
    }

    #[test]
    fn complete_applies_offset() {
        let mut r = req(22, 6);
        r.complete(b"hello world").unwrap();
        assert_eq!(r.buf.as_ref(), b"world");

        let mut r = req(22, 20);
        assert_eq!(r.complete(b"hello"), Err(ErrorCode::InvalidOffset));
    }
}
