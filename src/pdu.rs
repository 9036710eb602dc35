use structbuf::Unpacker;

use crate::{ErrorCode, ErrorRsp, Handle, HandleRange, Opcode, RspResult, Uuid};

/// Zero-copy view over one inbound PDU ([Vol 3] Part F, Section 3.3). The
/// typed accessors decode the fixed little-endian field layout of each
/// request, returning [`ErrorCode::InvalidPdu`] when the length does not
/// match and [`ErrorCode::InvalidHandle`] for impossible handle ranges.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct Pdu<'a>(&'a [u8]);

impl<'a> Pdu<'a> {
    /// Creates a PDU view over raw bytes.
    #[inline(always)]
    #[must_use]
    pub const fn new(b: &'a [u8]) -> Self {
        Self(b)
    }

    /// Returns the raw opcode byte.
    #[inline]
    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.0.first().copied().unwrap_or(0)
    }

    /// Returns the result of calling `f` to unpack the PDU parameters. `f`
    /// must consume the PDU exactly.
    #[inline]
    fn unpack<V>(
        &self,
        op: Opcode,
        f: impl FnOnce(&mut Unpacker<'a>) -> RspResult<V>,
    ) -> RspResult<V> {
        let mut p = Unpacker::new(self.0);
        let _ = p.skip(1); // Opcode
        p.map_or(op.err(ErrorCode::InvalidPdu), f)
    }

    /// Returns `ATT_EXCHANGE_MTU_REQ` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.2.1).
    pub fn exchange_mtu_req(&self) -> RspResult<u16> {
        self.unpack(Opcode::ExchangeMtuReq, |p| Ok(p.u16()))
    }

    /// Returns `ATT_FIND_INFORMATION_REQ` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.3.1).
    pub fn find_information_req(&self) -> RspResult<HandleRange> {
        const OP: Opcode = Opcode::FindInformationReq;
        let (start, end) = self.unpack(OP, |p| Ok((p.u16(), p.u16())))?;
        range_of(OP, start, end)
    }

    /// Returns `ATT_FIND_BY_TYPE_VALUE_REQ` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.3.3).
    pub fn find_by_type_value_req(&self) -> RspResult<(HandleRange, u16, &'a [u8])> {
        const OP: Opcode = Opcode::FindByTypeValueReq;
        let (start, end, typ, val) =
            self.unpack(OP, |p| Ok((p.u16(), p.u16(), p.u16(), p.take())))?;
        if !val.is_ok() {
            return OP.err(ErrorCode::InvalidPdu);
        }
        Ok((range_of(OP, start, end)?, typ, val.into_inner()))
    }

    /// Returns `ATT_READ_BY_TYPE_REQ` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.4.1).
    pub fn read_by_type_req(&self) -> RspResult<(HandleRange, Uuid)> {
        self.typed_range_req(Opcode::ReadByTypeReq)
    }

    /// Returns `ATT_READ_REQ` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.4.3).
    pub fn read_req(&self) -> RspResult<u16> {
        self.unpack(Opcode::ReadReq, |p| Ok(p.u16()))
    }

    /// Returns `ATT_READ_BLOB_REQ` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.4.5).
    pub fn read_blob_req(&self) -> RspResult<(u16, u16)> {
        self.unpack(Opcode::ReadBlobReq, |p| Ok((p.u16(), p.u16())))
    }

    /// Returns `ATT_READ_BY_GROUP_TYPE_REQ` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.4.9).
    pub fn read_by_group_type_req(&self) -> RspResult<(HandleRange, Uuid)> {
        self.typed_range_req(Opcode::ReadByGroupTypeReq)
    }

    /// Returns `ATT_WRITE_REQ` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.5.1). The value may be empty.
    pub fn write_req(&self) -> RspResult<(u16, &'a [u8])> {
        const OP: Opcode = Opcode::WriteReq;
        let (hdl, val) = self.unpack(OP, |p| Ok((p.u16(), p.take())))?;
        if val.is_ok() {
            Ok((hdl, val.into_inner()))
        } else {
            OP.err(ErrorCode::InvalidPdu)
        }
    }

    /// Returns `ATT_WRITE_CMD` PDU parameters
    /// ([Vol 3] Part F, Section 3.4.5.3). An empty value is invalid.
    pub fn write_cmd(&self) -> RspResult<(u16, &'a [u8])> {
        const OP: Opcode = Opcode::WriteCmd;
        let (hdl, val) = self.unpack(OP, |p| Ok((p.u16(), p.take())))?;
        if val.is_ok() && !val.is_empty() {
            Ok((hdl, val.into_inner()))
        } else {
            OP.err(ErrorCode::InvalidPdu)
        }
    }

    /// Decodes a `(starting handle, ending handle, type)` request, where the
    /// type is a 2- or 16-byte UUID.
    fn typed_range_req(&self, op: Opcode) -> RspResult<(HandleRange, Uuid)> {
        let (start, end, typ) = self.unpack(op, |p| Ok((p.u16(), p.u16(), p.take())))?;
        let Some(typ) = typ.is_ok().then(|| typ.into_inner()).and_then(|b| Uuid::try_from(b).ok())
        else {
            return op.err(ErrorCode::InvalidPdu);
        };
        Ok((range_of(op, start, end)?, typ))
    }
}

impl AsRef<[u8]> for Pdu<'_> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.0
    }
}

/// Validates a request handle range ([Vol 3] Part F, Section 3.4.3.1):
/// the starting handle must be non-zero and not greater than the ending
/// handle.
fn range_of(op: Opcode, start: u16, end: u16) -> RspResult<HandleRange> {
    match (Handle::new(start), Handle::new(end)) {
        (Some(s), Some(e)) if s <= e => Ok(HandleRange::new(s, e)),
        _ => Err(ErrorRsp::new(op as u8, Handle::new(start), ErrorCode::InvalidHandle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_mtu() {
        assert_eq!(Pdu::new(&[0x02, 0xB8, 0x00]).exchange_mtu_req(), Ok(184));
        let e = Pdu::new(&[0x02, 0xB8]).exchange_mtu_req().unwrap_err();
        assert_eq!(e.err, ErrorCode::InvalidPdu);
        let e = Pdu::new(&[0x02, 0xB8, 0x00, 0x00]).exchange_mtu_req().unwrap_err();
        assert_eq!((e.err, e.hdl), (ErrorCode::InvalidPdu, None));
    }

    #[test]
    fn find_information() {
        let r = Pdu::new(&[0x04, 0x01, 0x00, 0xFF, 0xFF]).find_information_req();
        assert_eq!(r, Ok(HandleRange::ALL));

        // Starting handle of zero
        let e = (Pdu::new(&[0x04, 0x00, 0x00, 0xFF, 0xFF]).find_information_req()).unwrap_err();
        assert_eq!((e.err, e.hdl), (ErrorCode::InvalidHandle, None));

        // Starting handle greater than the ending handle
        let e = (Pdu::new(&[0x04, 0x05, 0x00, 0x01, 0x00]).find_information_req()).unwrap_err();
        assert_eq!((e.err, e.hdl), (ErrorCode::InvalidHandle, Handle::new(5)));

        let e = Pdu::new(&[0x04, 0x01, 0x00]).find_information_req().unwrap_err();
        assert_eq!(e.err, ErrorCode::InvalidPdu);
    }

    #[test]
    fn find_by_type_value() {
        let r = Pdu::new(&[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x00, 0x18])
            .find_by_type_value_req();
        let (hdls, typ, val) = r.unwrap();
        assert_eq!(hdls, HandleRange::ALL);
        assert_eq!(typ, 0x2800);
        assert_eq!(val, &[0x00, 0x18]);

        // Empty value is allowed
        let r = Pdu::new(&[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]).find_by_type_value_req();
        assert_eq!(r.unwrap().2, &[] as &[u8]);

        let e = (Pdu::new(&[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00]).find_by_type_value_req())
            .unwrap_err();
        assert_eq!(e.err, ErrorCode::InvalidPdu);
    }

    #[test]
    fn read_by_type() {
        let (hdls, typ) = (Pdu::new(&[0x08, 0x01, 0x00, 0xFF, 0xFF, 0x19, 0x2A]))
            .read_by_type_req()
            .unwrap();
        assert_eq!(hdls, HandleRange::ALL);
        assert_eq!(typ.as_u16(), Some(0x2A19));

        let v = 0x12345678_9ABC_DEF0_1234_56789ABCDEF0_u128;
        let mut pdu = vec![0x08, 0x01, 0x00, 0xFF, 0xFF];
        pdu.extend_from_slice(&v.to_le_bytes());
        let (_, typ) = Pdu::new(&pdu).read_by_type_req().unwrap();
        assert_eq!(u128::from(typ), v);

        // Length must be 7 or 21
        let e = (Pdu::new(&[0x08, 0x01, 0x00, 0xFF, 0xFF, 0x19, 0x2A, 0x00]))
            .read_by_type_req()
            .unwrap_err();
        assert_eq!(e.err, ErrorCode::InvalidPdu);
    }

    #[test]
    fn read() {
        assert_eq!(Pdu::new(&[0x0A, 0x03, 0x00]).read_req(), Ok(3));
        let e = Pdu::new(&[0x0A, 0x03]).read_req().unwrap_err();
        assert_eq!(e.err, ErrorCode::InvalidPdu);
        assert_eq!(Pdu::new(&[0x0C, 0x03, 0x00, 0x05, 0x00]).read_blob_req(), Ok((3, 5)));
    }

    #[test]
    fn write() {
        let (hdl, val) = Pdu::new(&[0x12, 0x03, 0x00, 0x41]).write_req().unwrap();
        assert_eq!((hdl, val), (3, [0x41].as_slice()));
        // Empty value is allowed for a request, but not for a command
        assert_eq!(Pdu::new(&[0x12, 0x03, 0x00]).write_req(), Ok((3, [].as_slice())));
        let e = Pdu::new(&[0x52, 0x03, 0x00]).write_cmd().unwrap_err();
        assert_eq!(e.err, ErrorCode::InvalidPdu);
        let e = Pdu::new(&[0x12]).write_req().unwrap_err();
        assert_eq!(e.err, ErrorCode::InvalidPdu);
    }
}
