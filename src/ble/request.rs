//! Read/write authorization engine.
//!
//! Every read or write on an on-demand attribute reaches the application
//! as an authorize request. The engine validates it, runs the attribute
//! reader or writer, and answers with exactly one reply.
//!
//! A handler may answer [`Outcome::Deferred`]: the request then stays in
//! the single pending slot until [`AdvServer::complete_read`] or
//! [`AdvServer::complete_write`] is called with its [`Ticket`]. Any other
//! request arriving in the meantime is rejected with [`Error::Busy`].
//!
//! A completion carrying the ticket of an operation that is no longer
//! pending (timed out, or dropped on disconnection) is ignored.

use heapless::Vec;

use crate::config::TRANSIENT_STORAGE_SIZE;
use crate::error::{Error, Outcome};

use super::attribute::{AttrId, AttrUuid, AttributeDescriptor, UuidKind, Writer, CCCD_UUID};
use super::server::AdvServer;
use super::{Application, ConnHandle, GattLink, GattStatus};

/// Write sub-operation as reported by the protocol engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteOp {
    /// Write request, acknowledged.
    Request,
    /// Write command, unacknowledged.
    Command,
    SignedCommand,
    /// Queued (prepared) write.
    PrepareRequest,
    ExecuteNow,
    ExecuteCancel,
}

impl WriteOp {
    /// Decode a SoftDevice `BLE_GATTS_OP_*` value.
    pub const fn from_gatts_op(op: u8) -> Option<Self> {
        match op {
            1 => Some(WriteOp::Request),
            2 => Some(WriteOp::Command),
            3 => Some(WriteOp::SignedCommand),
            4 => Some(WriteOp::PrepareRequest),
            5 => Some(WriteOp::ExecuteCancel),
            6 => Some(WriteOp::ExecuteNow),
            _ => None,
        }
    }

    /// Part of a multi-part queued write.
    pub const fn is_queued(self) -> bool {
        matches!(
            self,
            WriteOp::PrepareRequest | WriteOp::ExecuteNow | WriteOp::ExecuteCancel
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadRequest {
    pub conn: ConnHandle,
    pub uuid: AttrUuid,
    pub offset: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteRequest<'a> {
    pub conn: ConnHandle,
    pub uuid: AttrUuid,
    pub op: WriteOp,
    pub offset: u16,
    pub data: &'a [u8],
}

/// Answer to a read authorize request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadReply<'a> {
    pub status: GattStatus,
    /// Serve `data` instead of the stored value.
    pub update: bool,
    pub data: &'a [u8],
}

/// Answer to a write authorize request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteReply<'a> {
    pub status: GattStatus,
    /// Commit `data` at `offset` into the stored value.
    pub update: bool,
    pub offset: u16,
    pub data: &'a [u8],
}

impl WriteReply<'_> {
    const fn rejected(status: GattStatus) -> Self {
        Self {
            status,
            update: false,
            offset: 0,
            data: &[],
        }
    }
}

/// Identifies one accepted request until it is answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ticket(pub u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PendingKind {
    Read,
    Write,
}

/// Request accepted by the engine and not answered yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingOp {
    pub ticket: Ticket,
    pub kind: PendingKind,
    pub attr: AttrId,
    pub offset: u16,
    pub len: u16,
    /// Copy of a deferred write payload.
    pub transient: Vec<u8, TRANSIENT_STORAGE_SIZE>,
    /// Worker engine time at acceptance (seconds).
    pub started_at: u32,
}

impl PendingOp {
    fn new(
        ticket: Ticket,
        kind: PendingKind,
        attr: AttrId,
        offset: u16,
        len: u16,
        started_at: u32,
    ) -> Self {
        Self {
            ticket,
            kind,
            attr,
            offset,
            len,
            transient: Vec::new(),
            started_at,
        }
    }
}

/// Failure status sent to the peer for a write.
const fn write_status(error: Error) -> GattStatus {
    match error {
        Error::Abort => GattStatus::UnlikelyError,
        _ => GattStatus::WriteNotPermitted,
    }
}

/// Failure status sent to the peer for a read.
const fn read_status(error: Error) -> GattStatus {
    match error {
        Error::Abort => GattStatus::UnlikelyError,
        _ => GattStatus::ReadNotPermitted,
    }
}

type Rejection = (Error, AttrId);

impl<C: Application + 'static, L: GattLink> AdvServer<C, L> {
    // Writes

    /// Handle a write authorize request.
    pub fn on_write_request(&mut self, req: &WriteRequest<'_>) {
        if !self.accepts(req.conn) {
            return;
        }

        if req.op.is_queued() {
            error!("Unsupported write operation: {:?}", req.op);
            self.link
                .reply_write(req.conn, &WriteReply::rejected(GattStatus::FeatureNotSupported));
            return;
        }

        let (desc, writer) = match self.check_write(req) {
            Ok(accepted) => accepted,
            Err((error, attr)) => {
                self.reject_write(req.conn, error, attr);
                return;
            }
        };

        self.workers.feed();
        let ticket = self.issue_ticket();
        self.pending = Some(PendingOp::new(
            ticket,
            PendingKind::Write,
            desc.id,
            req.offset,
            req.data.len() as u16,
            self.workers.time(),
        ));

        debug!("Write attribute {} ({} bytes)", desc.id.0, req.data.len());
        match writer(&mut self.app, req.data) {
            Ok(Outcome::Deferred) => {
                if let Some(op) = self.pending.as_mut() {
                    // Size was checked against the attribute, and writable
                    // attributes fit in transient storage.
                    let _ = op.transient.extend_from_slice(req.data);
                }
                debug!("Write attribute {} deferred", desc.id.0);
            }
            Ok(Outcome::Done) => self.finish_write(Ok(()), Some(req.data)),
            Err(error) => {
                error!("Write attribute {} failed: {:?}", desc.id.0, error);
                self.finish_write(Err(error), None);
            }
        }
    }

    /// Validate a write before any state is touched.
    fn check_write(
        &mut self,
        req: &WriteRequest<'_>,
    ) -> Result<(&'static AttributeDescriptor<C>, Writer<C>), Rejection> {
        if self.adv.entering_sleep() {
            warn!("Entering sleep, write rejected");
            return Err((Error::Abort, AttrId::ERROR));
        }
        let desc = match self.registry.resolve(&req.uuid) {
            Ok(desc) => desc,
            Err(error) => {
                error!("Write to unknown attribute {:?}", req.uuid);
                return Err((error, AttrId::ERROR));
            }
        };
        if self.pending.is_some() {
            warn!("Write attribute {} while busy", desc.id.0);
            return Err((Error::Busy, desc.id));
        }
        if req.op != WriteOp::Request {
            return Err((Error::InvalidCommand, desc.id));
        }
        if req.offset != 0 {
            return Err((Error::NotSupported, desc.id));
        }
        let len = req.data.len();
        if desc.varsize {
            if len > desc.size {
                return Err((Error::Overflow, desc.id));
            }
        } else if len != desc.size {
            return Err((Error::InvalidRequest, desc.id));
        }
        match desc.writer {
            Some(writer) => Ok((desc, writer)),
            None => Err((Error::ReadOnly, desc.id)),
        }
    }

    /// Answer a write that never reached the pending slot.
    fn reject_write(&mut self, conn: ConnHandle, error: Error, attr: AttrId) {
        if error.is_recorded() {
            self.record_error(error, attr);
        }
        self.link
            .reply_write(conn, &WriteReply::rejected(write_status(error)));
    }

    /// Finish the deferred write identified by `ticket`.
    pub fn complete_write(&mut self, ticket: Ticket, result: Result<(), Error>) {
        match self.claim(ticket) {
            Some(PendingKind::Write) => self.finish_write(result, None),
            Some(PendingKind::Read) => {
                error!("Write completion on a pending read");
                self.finish_read(Err(Error::Internal));
            }
            None => {}
        }
    }

    /// Finish the deferred read identified by `ticket`.
    ///
    /// The attribute content (see [`AdvServer::value_mut`]) must be filled in
    /// before a successful completion.
    pub fn complete_read(&mut self, ticket: Ticket, result: Result<(), Error>) {
        match self.claim(ticket) {
            Some(PendingKind::Read) => self.finish_read(result),
            Some(PendingKind::Write) => {
                error!("Read completion on a pending write");
                self.finish_write(Err(Error::Internal), None);
            }
            None => {}
        }
    }

    /// Kind of the pending operation if `ticket` still owns the slot.
    fn claim(&mut self, ticket: Ticket) -> Option<PendingKind> {
        match self.pending.as_ref().map(|op| (op.ticket, op.kind)) {
            Some((current, kind)) if current == ticket => Some(kind),
            Some((current, _)) => {
                error!("Stale completion {} ignored, {} is pending", ticket.0, current.0);
                None
            }
            None => {
                error!("Completion {} without pending operation", ticket.0);
                self.record_error(Error::Internal, AttrId::ERROR);
                None
            }
        }
    }

    /// Answer the pending write and release the slot.
    ///
    /// `payload` is the request data when completing within the request,
    /// otherwise the transient copy is used.
    pub(crate) fn finish_write(&mut self, result: Result<(), Error>, payload: Option<&[u8]>) {
        let op = self.pending.take();
        let result = match &op {
            Some(op) if op.kind == PendingKind::Write => result,
            Some(_) => {
                error!("Pending operation is not a write");
                Err(Error::Internal)
            }
            None => {
                error!("Write completion without pending operation");
                Err(Error::Internal)
            }
        };
        let attr = op.as_ref().map_or(AttrId::ERROR, |op| op.attr);

        let data: &[u8] = match (payload, &op) {
            (Some(payload), _) => payload,
            (None, Some(op)) => &op.transient,
            (None, None) => &[],
        };
        let offset = op.as_ref().map_or(0, |op| op.offset);

        let result = result.and_then(|()| self.values[attr.index()].commit(offset as usize, data));

        let reply = match result {
            Ok(()) => WriteReply {
                status: GattStatus::Success,
                update: true,
                offset,
                data,
            },
            Err(error) => {
                if error.is_recorded() {
                    self.record_error(error, attr);
                }
                WriteReply::rejected(write_status(error))
            }
        };

        match self.conn.handle() {
            Some(conn) => self.link.reply_write(conn, &reply),
            None => warn!("Write completion after disconnection dropped"),
        }

        if result.is_ok() && self.reboot_requested() {
            info!("Reboot requested, closing connection");
            self.disconnect();
        }
    }

    // Reads

    /// Handle a read authorize request.
    pub fn on_read_request(&mut self, req: &ReadRequest) {
        if !self.accepts(req.conn) {
            return;
        }

        let desc = match self.check_read(req) {
            Ok(desc) => desc,
            Err((error, attr)) => {
                if error.is_recorded() {
                    self.record_error(error, attr);
                }
                self.link.reply_read(
                    req.conn,
                    &ReadReply {
                        status: read_status(error),
                        update: false,
                        data: &[],
                    },
                );
                return;
            }
        };

        self.workers.feed();
        let ticket = self.issue_ticket();
        self.pending = Some(PendingOp::new(
            ticket,
            PendingKind::Read,
            desc.id,
            0,
            0,
            self.workers.time(),
        ));

        let value = &mut self.values[desc.id.index()];
        let _ = value.set_len(desc.initial_len());
        let rc = match desc.reader {
            Some(reader) => {
                debug!("Read attribute {}", desc.id.0);
                reader(&mut self.app, value)
            }
            None => Ok(Outcome::Done),
        };
        match rc {
            Ok(Outcome::Deferred) => debug!("Read attribute {} deferred", desc.id.0),
            Ok(Outcome::Done) => self.finish_read(Ok(())),
            Err(error) => {
                error!("Read attribute {} failed: {:?}", desc.id.0, error);
                self.finish_read(Err(error));
            }
        }
    }

    fn check_read(&mut self, req: &ReadRequest) -> Result<&'static AttributeDescriptor<C>, Rejection> {
        if self.adv.entering_sleep() {
            warn!("Entering sleep, read rejected");
            return Err((Error::Abort, AttrId::ERROR));
        }
        let desc = match self.registry.resolve(&req.uuid) {
            Ok(desc) => desc,
            Err(error) => {
                error!("Read of unknown attribute {:?}", req.uuid);
                return Err((error, AttrId::ERROR));
            }
        };
        if req.offset != 0 {
            return Err((Error::NotSupported, desc.id));
        }
        if self.pending.is_some() {
            warn!("Read attribute {} while busy", desc.id.0);
            return Err((Error::Busy, desc.id));
        }
        Ok(desc)
    }

    /// Answer the pending read and release the slot.
    ///
    /// On success the reply carries the attribute's current content.
    pub(crate) fn finish_read(&mut self, result: Result<(), Error>) {
        let op = self.pending.take();
        let result = match &op {
            Some(op) if op.kind == PendingKind::Read => result,
            Some(_) => {
                error!("Pending operation is not a read");
                Err(Error::Internal)
            }
            None => {
                error!("Read completion without pending operation");
                Err(Error::Internal)
            }
        };
        let attr = op.as_ref().map_or(AttrId::ERROR, |op| op.attr);

        let result = result.and_then(|()| {
            if self.values[attr.index()].is_empty() {
                error!("Read attribute {} produced no content", attr.0);
                Err(Error::Internal)
            } else {
                Ok(())
            }
        });

        if let Err(error) = result {
            if error.is_recorded() {
                self.record_error(error, attr);
            }
        }

        let Some(conn) = self.conn.handle() else {
            warn!("Read completion after disconnection dropped");
            return;
        };
        let reply = match result {
            Ok(()) => ReadReply {
                status: GattStatus::Success,
                update: true,
                data: self.values[attr.index()].as_bytes(),
            },
            Err(error) => ReadReply {
                status: read_status(error),
                update: false,
                data: &[],
            },
        };
        self.link.reply_read(conn, &reply);
    }

    // Plain writes

    /// Handle a committed, non-authorized write (descriptor writes).
    pub fn on_write_event(&mut self, conn: ConnHandle, uuid: &AttrUuid) {
        if !self.accepts(conn) {
            return;
        }
        self.workers.feed();
        match uuid.kind {
            UuidKind::Bluetooth if uuid.uuid == CCCD_UUID => {}
            UuidKind::Bluetooth => info!("Write to standard attribute {:x}", uuid.uuid),
            UuidKind::Vendor => {
                if let Err(error) = self.registry.resolve(uuid) {
                    self.record_error(error, AttrId::ERROR);
                }
            }
        }
    }
}
