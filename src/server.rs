use std::time::Duration;

use structbuf::{Pack, StructBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::{
    Attr, Channel, Db, Error, ErrorCode, ErrorRsp, Handle, IoReq, Opcode, Pdu, ReadReq, Result,
    RspResult, Uuid, Value, WriteReq, DEFAULT_MTU, MAX_MTU,
};


/// Number of rotating receive buffers, allowing one PDU to be processed
/// while the next is being read.
const RX_BUFS: usize = 2;

/// ATT server for one L2CAP channel ([Vol 3] Part F, Section 3.2.11). The
/// server enforces the sequential request-response protocol: requests are
/// dispatched one at a time in arrival order, and at most one notification
/// and one indication may be in flight.
#[derive(Debug)]
pub struct Server<T: Channel> {
    ch: T,
    db: Db,
    rx_mtu: u16,
    ntf_buf: Mutex<StructBuf>,
    ind_buf: Mutex<StructBuf>,
    confirm: parking_lot::Mutex<Option<oneshot::Sender<bool>>>,
}

impl<T: Channel> Server<T> {
    /// Creates an ATT server for the channel. Fails if the channel receive
    /// MTU is outside of `DEFAULT_MTU..=MAX_MTU`. Transmit-side buffers start
    /// at [`DEFAULT_MTU`] until the client performs MTU exchange.
    pub fn new(db: Db, ch: T) -> Result<Self> {
        let mtu = ch.rx_mtu();
        if !(DEFAULT_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::InvalidMtu(mtu));
        }
        let lim = usize::from(DEFAULT_MTU);
        Ok(Self {
            ch,
            db,
            rx_mtu: mtu,
            ntf_buf: Mutex::new(StructBuf::new(lim)),
            ind_buf: Mutex::new(StructBuf::new(lim)),
            confirm: parking_lot::Mutex::new(None),
        })
    }

    /// Receives and responds to client requests until the channel is torn
    /// down. Must be called exactly once per server; [`Server::notify`] and
    /// [`Server::indicate`] may be called concurrently while it runs.
    pub async fn serve(&self) -> Result<()> {
        let (pool_tx, pool_rx) = mpsc::channel(RX_BUFS);
        let (seq_tx, seq_rx) = mpsc::channel(1);
        for _ in 0..RX_BUFS {
            (pool_tx.try_send(PduBuf::new(self.rx_mtu))).expect("fresh buffer pool");
        }
        let (read, dispatch) = tokio::join!(
            self.read_loop(pool_rx, seq_tx),
            self.dispatch_loop(seq_rx, pool_tx),
        );
        dispatch?;
        match read {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Sends a Handle Value Notification ([Vol 3] Part F, Section 3.4.7.1).
    /// The value is truncated to the current transmit MTU minus 3.
    pub async fn notify(&self, hdl: Handle, val: &[u8]) -> Result<()> {
        let mut buf = self.ntf_buf.lock().await;
        value_pdu(&mut buf, Opcode::HandleValueNtf, hdl, val);
        self.ch.write(buf.as_ref()).await?;
        Ok(())
    }

    /// Sends a Handle Value Indication and waits for the client's
    /// confirmation ([Vol 3] Part F, Section 3.4.7.2 and 3.4.7.3). Returns
    /// [`Error::SeqProtoTimeout`] if the client does not confirm within the
    /// transaction timeout, or [`Error::ClosedPipe`] if the channel is torn
    /// down while waiting.
    pub async fn indicate(&self, hdl: Handle, val: &[u8]) -> Result<()> {
        let mut buf = self.ind_buf.lock().await;
        value_pdu(&mut buf, Opcode::HandleValueInd, hdl, val);
        let (tx, rx) = oneshot::channel();
        *self.confirm.lock() = Some(tx);
        if let Err(e) = self.ch.write(buf.as_ref()).await {
            self.confirm.lock().take();
            return Err(e.into());
        }
        // Transaction timeout ([Vol 3] Part F, Section 3.3.3)
        match tokio::time::timeout(Duration::from_secs(30), rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(_) => Err(Error::ClosedPipe),
            Err(_) => {
                self.confirm.lock().take();
                Err(Error::SeqProtoTimeout)
            }
        }
    }

    /// Reads inbound PDUs and hands them off for dispatch, consuming
    /// confirmations in-line so that a waiting indicator is woken even while
    /// a request is being processed. Returns the terminal read error, if any.
    async fn read_loop(
        &self,
        mut pool: mpsc::Receiver<PduBuf>,
        seq: mpsc::Sender<PduBuf>,
    ) -> Option<std::io::Error> {
        let mut err = None;
        'recv: while let Some(mut b) = pool.recv().await {
            loop {
                match self.ch.read(&mut b.buf).await {
                    Ok(0) => break 'recv,
                    Err(e) => {
                        err = Some(e);
                        break 'recv;
                    }
                    Ok(_) if b.buf[0] == u8::from(Opcode::HandleValueCfm) => self.confirmed(),
                    Ok(n) => {
                        b.len = n;
                        if seq.send(b).await.is_err() {
                            break 'recv;
                        }
                        continue 'recv;
                    }
                }
            }
        }
        self.close();
        err
    }

    /// Dispatches requests sequentially, writing at most one response per
    /// request.
    async fn dispatch_loop(
        &self,
        mut seq: mpsc::Receiver<PduBuf>,
        pool: mpsc::Sender<PduBuf>,
    ) -> Result<()> {
        let mut tx = StructBuf::new(usize::from(DEFAULT_MTU));
        while let Some(b) = seq.recv().await {
            let mtu = self.dispatch(b.as_ref(), &mut tx);
            if !tx.as_ref().is_empty() {
                trace!("ATT response: {:02X?}", tx.as_ref());
                if let Err(e) = self.ch.write(tx.as_ref()).await {
                    self.close();
                    return Err(e.into());
                }
            }
            if let Some(mtu) = mtu {
                self.commit_mtu(mtu, &mut tx).await;
            }
            if pool.send(b).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Delivers a confirmation to the waiting indicator, if any.
    fn confirmed(&self) {
        match self.confirm.lock().take() {
            Some(tx) => {
                let _ = tx.send(true);
            }
            None => warn!("spurious confirmation"),
        }
    }

    /// Closes the channel and wakes any blocked indicator with a negative
    /// signal.
    fn close(&self) {
        if let Some(tx) = self.confirm.lock().take() {
            let _ = tx.send(false);
        }
        self.ch.close();
    }

    /// Applies a new transmit MTU after the MTU exchange response has been
    /// emitted and before any other PDU is sent
    /// ([Vol 3] Part F, Section 3.4.2.2). All three transmit buffers are
    /// reallocated together.
    async fn commit_mtu(&self, mtu: u16, tx: &mut StructBuf) {
        self.ch.set_tx_mtu(mtu);
        let lim = usize::from(mtu);
        if lim == tx.lim() {
            return;
        }
        debug!("tx MTU is now {mtu}");
        *tx = StructBuf::new(lim);
        *self.ntf_buf.lock().await = StructBuf::new(lim);
        *self.ind_buf.lock().await = StructBuf::new(lim);
    }
}

/// Request dispatch. Each handler packs its response into `tx`, which is
/// capped at the current transmit MTU; an empty `tx` after dispatch means no
/// response is sent.
impl<T: Channel> Server<T> {
    /// Handles one client PDU, returning the new MTU to commit after an MTU
    /// exchange response.
    fn dispatch(&self, pdu: &[u8], tx: &mut StructBuf) -> Option<u16> {
        tx.clear();
        trace!("ATT request: {pdu:02X?}");
        let Some(&op) = pdu.first() else {
            return self.rsp_err(tx, ErrorRsp::new(0, None, ErrorCode::InvalidPdu));
        };
        let pdu = Pdu::new(pdu);
        let r = match Opcode::try_from(op) {
            Ok(Opcode::ExchangeMtuReq) => self.exchange_mtu(&pdu, tx),
            Ok(Opcode::FindInformationReq) => self.find_information(&pdu, tx).map(|()| None),
            Ok(Opcode::FindByTypeValueReq) => self.find_by_type_value(&pdu, tx).map(|()| None),
            Ok(Opcode::ReadByTypeReq) => self.read_by_type(&pdu, tx).map(|()| None),
            Ok(Opcode::ReadReq) => self.read(&pdu, tx).map(|()| None),
            Ok(Opcode::ReadBlobReq) => self.read_blob(&pdu, tx).map(|()| None),
            Ok(Opcode::ReadByGroupTypeReq) => self.read_by_group_type(&pdu, tx).map(|()| None),
            Ok(Opcode::WriteReq) => self.write(&pdu, tx).map(|()| None),
            Ok(Opcode::WriteCmd) => {
                self.write_cmd(&pdu);
                Ok(None)
            }
            // Read Multiple, Prepare Write, Execute Write, Signed Write, and
            // anything unknown
            _ => Err(ErrorRsp::new(op, None, ErrorCode::RequestNotSupported)),
        };
        match r {
            Ok(mtu) => mtu,
            Err(e) => self.rsp_err(tx, e),
        }
    }

    /// Packs an error response, except for commands, which never invoke a
    /// response of any kind ([Vol 3] Part F, Section 3.3).
    fn rsp_err(&self, tx: &mut StructBuf, e: ErrorRsp) -> Option<u16> {
        warn!("{e}");
        tx.clear();
        if !Opcode::is_cmd(e.req) {
            (tx.append().u8(Opcode::ErrorRsp).u8(e.req))
                .u16(e.hdl.map_or(0, u16::from))
                .u8(e.err);
        }
        None
    }

    /// Handles `ATT_EXCHANGE_MTU_REQ` ([Vol 3] Part F, Section 3.4.2.1). The
    /// response carries this server's receive MTU and is emitted from the
    /// current transmit buffer; the new transmit MTU takes effect only after
    /// emission.
    fn exchange_mtu(&self, pdu: &Pdu, tx: &mut StructBuf) -> RspResult<Option<u16>> {
        const OP: Opcode = Opcode::ExchangeMtuReq;
        let client = pdu.exchange_mtu_req()?;
        if client < DEFAULT_MTU {
            return OP.err(ErrorCode::InvalidPdu);
        }
        tx.append().u8(Opcode::ExchangeMtuRsp).u16(self.rx_mtu);
        Ok(Some(client))
    }

    /// Handles `ATT_FIND_INFORMATION_REQ`
    /// ([Vol 3] Part F, Section 3.4.3.1 and 3.4.3.2). The format is fixed by
    /// the first attribute; enumeration halts at the first attribute with a
    /// different type width.
    fn find_information(&self, pdu: &Pdu, tx: &mut StructBuf) -> RspResult<()> {
        const OP: Opcode = Opcode::FindInformationReq;
        let hdls = pdu.find_information_req()?;
        tx.append().u8(Opcode::FindInformationRsp).u8(0_u8);
        let mut fmt = 0_u8;
        for at in self.db.range(hdls) {
            let typ16 = at.typ().as_uuid16();
            if fmt == 0 {
                fmt = if typ16.is_some() { 0x01 } else { 0x02 };
                tx.put_at(1, &[fmt]);
            }
            match (fmt, typ16) {
                (0x01, Some(_)) | (0x02, None) => {}
                _ => break,
            }
            let n = 2 + if typ16.is_some() { 2 } else { 16 };
            if tx.len() + n > tx.lim() {
                break;
            }
            let mut p = tx.append();
            p.u16(at.handle());
            match typ16 {
                Some(u) => p.u16(u.raw()),
                None => p.u128(at.typ()),
            };
        }
        if fmt == 0 {
            return OP.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
        }
        Ok(())
    }

    /// Handles `ATT_FIND_BY_TYPE_VALUE_REQ`
    /// ([Vol 3] Part F, Section 3.4.3.3 and 3.4.3.4). Each record pairs the
    /// found handle with the group ending handle; for dynamic attributes the
    /// group end is the attribute handle itself.
    fn find_by_type_value(&self, pdu: &Pdu, tx: &mut StructBuf) -> RspResult<()> {
        const OP: Opcode = Opcode::FindByTypeValueReq;
        let (hdls, _typ, want) = pdu.find_by_type_value_req()?;
        tx.append().u8(Opcode::FindByTypeValueRsp);
        // The value shall not exceed MTU - 7 bytes. One extra byte of buffer
        // makes a handler overflow detectable.
        let cap = tx.lim() - 7;
        for at in self.db.range(hdls) {
            let mut req = ReadReq::new(OP, cap + 1);
            let (v, end): (&[u8], Handle) = match at.val() {
                Value::Static(v) => (v, at.ending_handle()),
                Value::Dynamic(io) => {
                    req.with(at.handle(), at.typ(), 0);
                    if io.call(IoReq::Read(&mut req)).is_err() || req.buf.len() > cap {
                        return OP.hdl_err(ErrorCode::InvalidHandle, hdls.start());
                    }
                    (req.buf.as_ref(), at.handle())
                }
            };
            if !value_eq(v, want) {
                continue;
            }
            if tx.len() + 4 > tx.lim() {
                break;
            }
            tx.append().u16(at.handle()).u16(end);
        }
        if tx.len() <= 1 {
            return OP.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
        }
        Ok(())
    }

    /// Handles `ATT_READ_BY_TYPE_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.1 and 3.4.4.2). The first matching
    /// value fixes the record length; a handler error on the first value is
    /// propagated, later errors truncate the response silently.
    fn read_by_type(&self, pdu: &Pdu, tx: &mut StructBuf) -> RspResult<()> {
        const OP: Opcode = Opcode::ReadByTypeReq;
        let (hdls, typ) = pdu.read_by_type_req()?;
        tx.append().u8(Opcode::ReadByTypeRsp).u8(0_u8);
        let mut dlen = 0;
        for at in self.db.range(hdls) {
            if at.typ() != typ {
                continue;
            }
            let mut req = ReadReq::new(OP, tx.lim() - 2);
            let v: &[u8] = match at.val() {
                Value::Static(v) => v,
                Value::Dynamic(io) => {
                    req.with(at.handle(), at.typ(), 0);
                    match io.call(IoReq::Read(&mut req)) {
                        Ok(()) => req.buf.as_ref(),
                        Err(e) if dlen == 0 => return OP.hdl_err(e, hdls.start()),
                        Err(_) => break,
                    }
                }
            };
            if dlen == 0 {
                dlen = (2 + v.len()).min(255).min(tx.lim() - 2);
                #[allow(clippy::cast_possible_truncation)]
                tx.put_at(1, &[dlen as u8]);
            } else if 2 + v.len() != dlen {
                break;
            }
            if tx.len() + dlen > tx.lim() {
                break;
            }
            tx.append().u16(at.handle()).put(&v[..dlen - 2]);
        }
        if dlen == 0 {
            return OP.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
        }
        Ok(())
    }

    /// Handles `ATT_READ_REQ` ([Vol 3] Part F, Section 3.4.4.3 and 3.4.4.4).
    fn read(&self, pdu: &Pdu, tx: &mut StructBuf) -> RspResult<()> {
        let hdl = pdu.read_req()?;
        self.read_value(Opcode::ReadReq, Opcode::ReadRsp, hdl, 0, tx)
    }

    /// Handles `ATT_READ_BLOB_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.5 and 3.4.4.6). The offset is passed
    /// through to the handler; a static value is returned as-is.
    fn read_blob(&self, pdu: &Pdu, tx: &mut StructBuf) -> RspResult<()> {
        let (hdl, off) = pdu.read_blob_req()?;
        self.read_value(Opcode::ReadBlobReq, Opcode::ReadBlobRsp, hdl, off, tx)
    }

    /// Resolves a point read of one attribute value.
    fn read_value(
        &self,
        op: Opcode,
        rsp: Opcode,
        hdl: u16,
        off: u16,
        tx: &mut StructBuf,
    ) -> RspResult<()> {
        let at = self.lookup(op, hdl)?;
        tx.append().u8(rsp);
        match at.val() {
            Value::Static(v) => {
                let n = v.len().min(tx.lim() - 1);
                tx.append().put(&v[..n]);
            }
            Value::Dynamic(io) => {
                let mut req = ReadReq::new(op, tx.lim() - 1);
                req.with(at.handle(), at.typ(), off);
                (io.call(IoReq::Read(&mut req)))
                    .map_err(|e| ErrorRsp::new(u8::from(op), Some(at.handle()), e))?;
                tx.append().put(req.buf.as_ref());
            }
        }
        Ok(())
    }

    /// Handles `ATT_READ_BY_GROUP_TYPE_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.9 and 3.4.4.10). Unlike Read By Type,
    /// a handler error on any match aborts the whole response.
    fn read_by_group_type(&self, pdu: &Pdu, tx: &mut StructBuf) -> RspResult<()> {
        const OP: Opcode = Opcode::ReadByGroupTypeReq;
        let (hdls, _typ) = pdu.read_by_group_type_req()?;
        tx.append().u8(Opcode::ReadByGroupTypeRsp).u8(0_u8);
        let mut dlen = 0;
        for at in self.db.range(hdls) {
            let mut req = ReadReq::new(OP, (tx.lim() - tx.len()).saturating_sub(4));
            let v: &[u8] = match at.val() {
                Value::Static(v) => v,
                Value::Dynamic(io) => {
                    req.with(at.handle(), at.typ(), 0);
                    (io.call(IoReq::Read(&mut req)))
                        .map_err(|e| ErrorRsp::new(OP as u8, Some(hdls.start()), e))?;
                    req.buf.as_ref()
                }
            };
            if dlen == 0 {
                dlen = (4 + v.len()).min(255).min(tx.lim() - 2);
                #[allow(clippy::cast_possible_truncation)]
                tx.put_at(1, &[dlen as u8]);
            } else if 4 + v.len() != dlen {
                break;
            }
            if tx.len() + dlen > tx.lim() {
                break;
            }
            (tx.append().u16(at.handle()).u16(at.ending_handle())).put(&v[..dlen - 4]);
        }
        if dlen == 0 {
            return OP.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
        }
        Ok(())
    }

    /// Handles `ATT_WRITE_REQ` ([Vol 3] Part F, Section 3.4.5.1 and 3.4.5.2).
    /// Static attributes are not writable.
    fn write(&self, pdu: &Pdu, tx: &mut StructBuf) -> RspResult<()> {
        const OP: Opcode = Opcode::WriteReq;
        let (hdl, val) = pdu.write_req()?;
        let at = self.lookup(OP, hdl)?;
        match at.val() {
            Value::Static(_) => OP.hdl_err(ErrorCode::WriteNotPermitted, at.handle()),
            Value::Dynamic(io) => {
                let req = WriteReq {
                    op: OP,
                    hdl: at.handle(),
                    val,
                };
                (io.call(IoReq::Write(&req)))
                    .map_err(|e| ErrorRsp::new(OP as u8, Some(at.handle()), e))?;
                tx.append().u8(Opcode::WriteRsp);
                Ok(())
            }
        }
    }

    /// Handles `ATT_WRITE_CMD` ([Vol 3] Part F, Section 3.4.5.3). Commands
    /// never invoke a response; all failures are swallowed.
    fn write_cmd(&self, pdu: &Pdu) {
        const OP: Opcode = Opcode::WriteCmd;
        let Ok((hdl, val)) = pdu.write_cmd() else { return };
        let Some(at) = Handle::new(hdl).and_then(|h| self.db.get(h)) else {
            return;
        };
        if let Value::Dynamic(io) = at.val() {
            let req = WriteReq {
                op: OP,
                hdl: at.handle(),
                val,
            };
            if let Err(e) = io.call(IoReq::Write(&req)) {
                debug!("write command for {} failed with {e}", at.handle());
            }
        }
    }

    /// Resolves an attribute by raw handle.
    fn lookup(&self, op: Opcode, hdl: u16) -> RspResult<&Attr> {
        let h = Handle::new(hdl);
        (h.and_then(|h| self.db.get(h)))
            .ok_or_else(|| ErrorRsp::new(u8::from(op), h, ErrorCode::InvalidHandle))
    }
}

/// One inbound PDU buffer sized to the receive MTU.
#[derive(Debug)]
struct PduBuf {
    buf: Box<[u8]>,
    len: usize,
}

impl PduBuf {
    fn new(mtu: u16) -> Self {
        Self {
            buf: vec![0; usize::from(mtu)].into_boxed_slice(),
            len: 0,
        }
    }
}

impl AsRef<[u8]> for PduBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Frames a Handle Value Notification or Indication, truncating the value to
/// the transmit MTU minus the 3-byte header
/// ([Vol 3] Part F, Section 3.4.7.1).
fn value_pdu(buf: &mut StructBuf, op: Opcode, hdl: Handle, val: &[u8]) {
    buf.clear();
    let cap = buf.lim() - 3;
    (buf.append().u8(op).u16(hdl)).put(&val[..val.len().min(cap)]);
}

/// Compares an attribute value with the requested value, treating 2- and
/// 16-byte values as UUIDs so that the two forms of the same UUID match.
fn value_eq(a: &[u8], b: &[u8]) -> bool {
    match (Uuid::try_from(a), Uuid::try_from(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
