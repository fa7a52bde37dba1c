//! Unit tests for the GATT request engine and the connection lifecycle.
//!
//! These tests run on the host (not embedded): a recording [`GattLink`]
//! stands in for the SoftDevice and captures every reply, disconnection,
//! advertising restart and reboot.

use std::vec::Vec as StdVec;

use super::attribute::{AttrId, AttrUuid, AttrValue, AttributeDescriptor, Permission, Registry};
use super::error_record::ERROR_RECORD_SIZE;
use super::request::{PendingKind, ReadRequest, Ticket, WriteOp, WriteRequest};
use super::{
    AdvEvent, AdvMode, AdvServer, AdvertisingConfig, Application, BleEvent, ConnHandle,
    ConnParams, DisconnectReason, GattLink, GattStatus, PeerAddress, ReadReply, ReplySlot,
    WriteReply,
};
use crate::config::{COMMAND_DELAY_SECS, STALL_DELAY_SECS, WORKER_PACE_SECS};
use crate::error::{Error, HandlerResult, Outcome};
use crate::worker::Worker;

// ═══════════════════════════════════════════════════════════════════════════
// Test bench
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Bench {
    defer: bool,
    fail: Option<Error>,
    counter: u8,
    reads: u32,
    writes: u32,
    reboot: bool,
    worker_runs: u32,
}

impl Application for Bench {
    fn take_reboot_request(&mut self) -> bool {
        core::mem::take(&mut self.reboot)
    }
}

fn outcome(bench: &Bench) -> HandlerResult {
    match bench.fail {
        Some(error) => Err(error),
        None if bench.defer => Ok(Outcome::Deferred),
        None => Ok(Outcome::Done),
    }
}

fn read_counter(bench: &mut Bench, value: &mut AttrValue) -> HandlerResult {
    bench.reads += 1;
    value.storage_mut()[0] = bench.counter;
    outcome(bench)
}

fn read_nothing(bench: &mut Bench, _: &mut AttrValue) -> HandlerResult {
    bench.reads += 1;
    Ok(Outcome::Done)
}

fn read_later(bench: &mut Bench, _: &mut AttrValue) -> HandlerResult {
    bench.reads += 1;
    Ok(Outcome::Deferred)
}

fn write_value(bench: &mut Bench, _: &[u8]) -> HandlerResult {
    bench.writes += 1;
    outcome(bench)
}

fn write_reboot(bench: &mut Bench, _: &[u8]) -> HandlerResult {
    bench.reboot = true;
    Ok(Outcome::Done)
}

const ERROR: u8 = 0;
const COUNTER: u8 = 1;
const VALUE: u8 = 2;
const FIXED: u8 = 3;
const EMPTY: u8 = 4;
const REBOOT: u8 = 5;
const STREAM: u8 = 6;
const UNKNOWN: u8 = 7;

static TABLE: [AttributeDescriptor<Bench>; 7] = [
    AttributeDescriptor {
        id: AttrId(ERROR),
        size: ERROR_RECORD_SIZE,
        varsize: false,
        permission: Permission::ReadNotify,
        reader: None,
        writer: None,
        label: "error",
    },
    AttributeDescriptor {
        id: AttrId(COUNTER),
        size: 1,
        varsize: false,
        permission: Permission::ReadOnDemand,
        reader: Some(read_counter),
        writer: None,
        label: "counter",
    },
    AttributeDescriptor {
        id: AttrId(VALUE),
        size: 4,
        varsize: true,
        permission: Permission::Write,
        reader: None,
        writer: Some(write_value),
        label: "value",
    },
    AttributeDescriptor {
        id: AttrId(FIXED),
        size: 2,
        varsize: false,
        permission: Permission::Write,
        reader: None,
        writer: Some(write_value),
        label: "fixed",
    },
    AttributeDescriptor {
        id: AttrId(EMPTY),
        size: 4,
        varsize: true,
        permission: Permission::ReadOnDemand,
        reader: Some(read_nothing),
        writer: None,
        label: "empty",
    },
    AttributeDescriptor {
        id: AttrId(REBOOT),
        size: 1,
        varsize: false,
        permission: Permission::Write,
        reader: None,
        writer: Some(write_reboot),
        label: "reboot",
    },
    AttributeDescriptor {
        id: AttrId(STREAM),
        size: 8,
        varsize: true,
        permission: Permission::ReadOnDemand,
        reader: Some(read_later),
        writer: None,
        label: "stream",
    },
];

static REGISTRY: Registry<Bench> = Registry::new(&TABLE);

#[derive(Debug, PartialEq)]
struct Reply {
    conn: ConnHandle,
    status: GattStatus,
    update: bool,
    data: StdVec<u8>,
}

#[derive(Default)]
struct RecordingLink {
    reads: StdVec<Reply>,
    writes: StdVec<Reply>,
    disconnects: StdVec<(ConnHandle, DisconnectReason)>,
    advertising: StdVec<(AdvMode, AdvertisingConfig)>,
    sys_attrs: StdVec<ConnHandle>,
    reboots: u32,
    refuse_disconnect: bool,
    /// Write reply handles, as the SoftDevice hands them out.
    write_tokens: ReplySlot<u32>,
    answered: StdVec<Option<u32>>,
}

impl RecordingLink {
    fn replies(&self) -> usize {
        self.reads.len() + self.writes.len()
    }
}

impl GattLink for RecordingLink {
    fn reply_read(&mut self, conn: ConnHandle, reply: &ReadReply<'_>) {
        self.reads.push(Reply {
            conn,
            status: reply.status,
            update: reply.update,
            data: reply.data.to_vec(),
        });
    }

    fn reply_write(&mut self, conn: ConnHandle, reply: &WriteReply<'_>) {
        self.answered.push(self.write_tokens.take());
        self.writes.push(Reply {
            conn,
            status: reply.status,
            update: reply.update,
            data: reply.data.to_vec(),
        });
    }

    fn disconnect(&mut self, conn: ConnHandle, reason: DisconnectReason) -> Result<(), Error> {
        self.disconnects.push((conn, reason));
        if self.refuse_disconnect {
            return Err(Error::Io);
        }
        Ok(())
    }

    fn start_advertising(&mut self, mode: AdvMode, config: &AdvertisingConfig) {
        self.advertising.push((mode, *config));
    }

    fn set_default_sys_attrs(&mut self, conn: ConnHandle) {
        self.sys_attrs.push(conn);
    }

    fn reboot(&mut self) {
        self.reboots += 1;
    }
}

type TestServer = AdvServer<Bench, RecordingLink>;

const CONN: ConnHandle = ConnHandle(1);
const OTHER: ConnHandle = ConnHandle(7);
const PEER: PeerAddress = PeerAddress([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);

fn started() -> TestServer {
    let mut server = AdvServer::new(REGISTRY, Bench::default(), RecordingLink::default());
    server.start();
    server
}

fn connected() -> TestServer {
    let mut server = started();
    server.handle_event(BleEvent::Connected { conn: CONN, peer: PEER });
    server
}

fn write_op(server: &mut TestServer, id: u8, op: WriteOp, offset: u16, data: &[u8]) {
    server.handle_event(BleEvent::Write(WriteRequest {
        conn: CONN,
        uuid: AttrId(id).uuid(),
        op,
        offset,
        data,
    }));
}

fn write(server: &mut TestServer, id: u8, data: &[u8]) {
    write_op(server, id, WriteOp::Request, 0, data);
}

/// Write with a reply handle, parked the way the SoftDevice glue does it.
fn write_with_token(server: &mut TestServer, id: u8, data: &[u8], token: u32) {
    let displaced = server.link_mut().write_tokens.park(token);
    write(server, id, data);
    server.link_mut().write_tokens.restore(displaced);
}

fn read(server: &mut TestServer, id: u8) {
    server.handle_event(BleEvent::Read(ReadRequest {
        conn: CONN,
        uuid: AttrId(id).uuid(),
        offset: 0,
    }));
}

fn ticket(server: &TestServer) -> Ticket {
    server.pending_ticket().expect("nothing pending")
}

fn last_write(server: &TestServer) -> &Reply {
    server.link().writes.last().expect("no write reply")
}

fn last_read(server: &TestServer) -> &Reply {
    server.link().reads.last().expect("no read reply")
}

fn assert_recorded(server: &TestServer, error: Error, id: u8) {
    let record = server.last_error();
    assert_eq!(record.error(), Some(error));
    assert_eq!(record.attr, id);
}

fn assert_nothing_recorded(server: &TestServer) {
    assert_eq!(server.last_error().error(), None);
}

// ═══════════════════════════════════════════════════════════════════════════
// Write Requests
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn write_commits_value_and_replies_once() {
    let mut server = connected();
    write(&mut server, FIXED, &[0x12, 0x34]);

    assert_eq!(server.link().writes.len(), 1);
    assert_eq!(
        *last_write(&server),
        Reply {
            conn: CONN,
            status: GattStatus::Success,
            update: true,
            data: vec![0x12, 0x34],
        }
    );
    assert_eq!(server.value(AttrId(FIXED)).as_bytes(), &[0x12, 0x34]);
    assert_eq!(server.app().writes, 1);
    assert!(server.pending().is_none());
    assert_nothing_recorded(&server);
}

#[test]
fn write_variable_size_shorter_is_accepted() {
    let mut server = connected();
    write(&mut server, VALUE, &[9]);

    assert_eq!(last_write(&server).status, GattStatus::Success);
    assert_eq!(server.value(AttrId(VALUE)).as_bytes(), &[9]);
}

#[test]
fn write_fixed_size_mismatch_is_invalid_request() {
    let mut server = connected();
    write(&mut server, FIXED, &[1]);

    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert!(!last_write(&server).update);
    assert_recorded(&server, Error::InvalidRequest, FIXED);
    assert_eq!(server.app().writes, 0);
}

#[test]
fn write_variable_size_too_long_overflows() {
    let mut server = connected();
    write(&mut server, VALUE, &[1, 2, 3, 4, 5]);

    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::Overflow, VALUE);
}

#[test]
fn write_with_offset_is_not_supported() {
    let mut server = connected();
    write_op(&mut server, VALUE, WriteOp::Request, 1, &[1]);

    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::NotSupported, VALUE);
}

#[test]
fn write_without_writer_is_read_only() {
    let mut server = connected();
    write(&mut server, COUNTER, &[1]);

    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::ReadOnly, COUNTER);
}

#[test]
fn error_attribute_is_read_only() {
    let mut server = connected();
    write(&mut server, ERROR, &[0; ERROR_RECORD_SIZE]);

    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::ReadOnly, ERROR);
}

#[test]
fn write_command_is_invalid() {
    let mut server = connected();
    write_op(&mut server, VALUE, WriteOp::Command, 0, &[1]);

    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::InvalidCommand, VALUE);
}

#[test]
fn queued_writes_are_rejected_without_side_effects() {
    let mut server = connected();
    for op in [WriteOp::PrepareRequest, WriteOp::ExecuteNow, WriteOp::ExecuteCancel] {
        write_op(&mut server, VALUE, op, 0, &[1]);
        assert_eq!(last_write(&server).status, GattStatus::FeatureNotSupported);
    }
    assert_eq!(server.link().writes.len(), 3);
    assert!(server.pending().is_none());
    assert_eq!(server.app().writes, 0);
    assert_nothing_recorded(&server);
}

#[test]
fn write_to_unknown_uuid_is_recorded_against_error_attribute() {
    let mut server = connected();
    write(&mut server, UNKNOWN, &[1]);

    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::InvalidUuid, ERROR);

    server.handle_event(BleEvent::Write(WriteRequest {
        conn: CONN,
        uuid: AttrUuid::bluetooth(0x2A00),
        op: WriteOp::Request,
        offset: 0,
        data: &[1],
    }));
    assert_eq!(server.link().writes.len(), 2);
    assert_recorded(&server, Error::InvalidUuid, ERROR);
}

#[test]
fn writer_failure_is_recorded() {
    let mut server = connected();
    server.app_mut().fail = Some(Error::OutOfRange);
    write(&mut server, FIXED, &[1, 2]);

    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::OutOfRange, FIXED);
    assert_eq!(server.value(AttrId(FIXED)).as_bytes(), &[0, 0]);
    assert!(server.pending().is_none());
}

// ═══════════════════════════════════════════════════════════════════════════
// Deferred Writes
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn deferred_write_replies_on_completion() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);

    assert!(server.link().writes.is_empty());
    let pending = server.pending().expect("write should be pending");
    assert_eq!(pending.kind, PendingKind::Write);
    assert_eq!(pending.attr, AttrId(FIXED));
    assert_eq!(pending.transient.as_slice(), &[7, 8]);

    server.complete_write(ticket(&server), Ok(()));
    assert_eq!(
        *last_write(&server),
        Reply {
            conn: CONN,
            status: GattStatus::Success,
            update: true,
            data: vec![7, 8],
        }
    );
    assert_eq!(server.value(AttrId(FIXED)).as_bytes(), &[7, 8]);
    assert!(server.pending().is_none());
}

#[test]
fn requests_during_deferred_write_are_busy() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);

    write(&mut server, VALUE, &[1]);
    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::Busy, VALUE);

    read(&mut server, COUNTER);
    assert_eq!(last_read(&server).status, GattStatus::ReadNotPermitted);
    assert_recorded(&server, Error::Busy, COUNTER);

    // The first request is still the one pending.
    assert_eq!(server.pending().map(|op| op.attr), Some(AttrId(FIXED)));
    assert_eq!(server.app().writes, 1);
    assert_eq!(server.app().reads, 0);
}

#[test]
fn busy_reply_leaves_pending_reply_handle_in_place() {
    let mut server = connected();
    server.app_mut().defer = true;
    write_with_token(&mut server, FIXED, &[7, 8], 1);
    assert!(server.link().answered.is_empty());
    assert!(server.link().write_tokens.is_held());

    write_with_token(&mut server, VALUE, &[1], 2);
    assert_eq!(server.link().answered, vec![Some(2)]);
    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);

    server.complete_write(ticket(&server), Ok(()));
    assert_eq!(server.link().answered, vec![Some(2), Some(1)]);
    assert_eq!(last_write(&server).status, GattStatus::Success);
    assert!(!server.link().write_tokens.is_held());
}

#[test]
fn reply_slot_restores_only_a_displaced_handle() {
    let mut slot = ReplySlot::new();
    assert_eq!(slot.park(1), None);
    slot.restore(None);
    assert_eq!(slot.take(), Some(1));

    slot.park(1);
    let displaced = slot.park(2);
    assert_eq!(displaced, Some(1));
    // The second request stayed pending: its handle wins.
    slot.restore(displaced);
    assert_eq!(slot.take(), Some(2));
    assert_eq!(slot.take(), None);
}

#[test]
fn deferred_write_failure_keeps_value() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);

    server.complete_write(ticket(&server), Err(Error::Io));
    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::Io, FIXED);
    assert_eq!(server.value(AttrId(FIXED)).as_bytes(), &[0, 0]);
}

#[test]
fn deferred_write_abort_is_unlikely_error_and_not_recorded() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);

    server.complete_write(ticket(&server), Err(Error::Abort));
    assert_eq!(last_write(&server).status, GattStatus::UnlikelyError);
    assert_nothing_recorded(&server);
}

#[test]
fn zero_length_deferred_write_succeeds() {
    let mut server = connected();
    write(&mut server, VALUE, &[1, 2]);
    server.app_mut().defer = true;
    write(&mut server, VALUE, &[]);

    server.complete_write(ticket(&server), Ok(()));
    assert_eq!(last_write(&server).status, GattStatus::Success);
    assert!(server.value(AttrId(VALUE)).is_empty());
}

#[test]
fn write_completion_without_pending_is_internal_and_unanswered() {
    let mut server = connected();
    server.complete_write(Ticket(1), Ok(()));

    assert_eq!(server.link().replies(), 0);
    assert_recorded(&server, Error::Internal, ERROR);
}

#[test]
fn read_completion_on_pending_write_answers_the_write() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);

    server.complete_read(ticket(&server), Ok(()));
    assert!(server.link().reads.is_empty());
    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::Internal, FIXED);
    assert!(server.pending().is_none());
    assert_eq!(server.value(AttrId(FIXED)).as_bytes(), &[0, 0]);
}

#[test]
fn late_completion_after_expiry_leaves_next_request_pending() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);
    let first = ticket(&server);

    for _ in 0..=COMMAND_DELAY_SECS / WORKER_PACE_SECS {
        server.tick();
    }
    assert!(server.pending().is_none());
    assert_eq!(server.link().writes.len(), 1);

    write(&mut server, VALUE, &[9]);
    let second = ticket(&server);
    assert_ne!(first, second);

    // The handler of the expired write reports back too late.
    server.complete_write(first, Err(Error::Io));
    assert_eq!(server.pending_ticket(), Some(second));
    assert_eq!(server.link().writes.len(), 1);
    assert_recorded(&server, Error::Internal, FIXED);

    server.complete_write(second, Ok(()));
    assert_eq!(server.link().writes.len(), 2);
    assert_eq!(last_write(&server).status, GattStatus::Success);
    assert_eq!(server.value(AttrId(VALUE)).as_bytes(), &[9]);
}

#[test]
fn repeated_completion_is_ignored() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);
    let first = ticket(&server);
    server.complete_write(first, Ok(()));

    read(&mut server, COUNTER);
    server.complete_write(first, Err(Error::Io));
    assert_eq!(server.pending().map(|op| op.kind), Some(PendingKind::Read));
    assert_eq!(server.link().replies(), 1);
    assert_nothing_recorded(&server);
}

// ═══════════════════════════════════════════════════════════════════════════
// Read Requests
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn read_refreshes_value_through_reader() {
    let mut server = connected();
    server.app_mut().counter = 42;
    read(&mut server, COUNTER);

    assert_eq!(
        *last_read(&server),
        Reply {
            conn: CONN,
            status: GattStatus::Success,
            update: true,
            data: vec![42],
        }
    );
    assert_eq!(server.app().reads, 1);
    assert!(server.pending().is_none());
}

#[test]
fn deferred_read_replies_on_completion() {
    let mut server = connected();
    server.app_mut().defer = true;
    server.app_mut().counter = 3;
    read(&mut server, COUNTER);

    assert!(server.link().reads.is_empty());
    assert_eq!(server.pending().map(|op| op.kind), Some(PendingKind::Read));

    server.complete_read(ticket(&server), Ok(()));
    assert_eq!(last_read(&server).status, GattStatus::Success);
    assert_eq!(last_read(&server).data, vec![3]);
}

#[test]
fn deferred_read_content_is_filled_before_completion() {
    let mut server = connected();
    read(&mut server, STREAM);
    assert!(server.link().reads.is_empty());
    assert!(server.value(AttrId(STREAM)).is_empty());

    server.value_mut(AttrId(STREAM)).set(b"abc").expect("fits");
    server.complete_read(ticket(&server), Ok(()));

    assert_eq!(
        *last_read(&server),
        Reply {
            conn: CONN,
            status: GattStatus::Success,
            update: true,
            data: b"abc".to_vec(),
        }
    );
    assert!(server.pending().is_none());
    assert_nothing_recorded(&server);
}

#[test]
fn deferred_read_left_empty_is_internal() {
    let mut server = connected();
    read(&mut server, STREAM);
    server.complete_read(ticket(&server), Ok(()));

    assert_eq!(last_read(&server).status, GattStatus::ReadNotPermitted);
    assert_recorded(&server, Error::Internal, STREAM);
}

#[test]
fn read_with_empty_content_is_internal() {
    let mut server = connected();
    read(&mut server, EMPTY);

    assert_eq!(last_read(&server).status, GattStatus::ReadNotPermitted);
    assert!(last_read(&server).data.is_empty());
    assert_recorded(&server, Error::Internal, EMPTY);
}

#[test]
fn read_with_offset_is_not_supported() {
    let mut server = connected();
    server.handle_event(BleEvent::Read(ReadRequest {
        conn: CONN,
        uuid: AttrId(COUNTER).uuid(),
        offset: 1,
    }));

    assert_eq!(last_read(&server).status, GattStatus::ReadNotPermitted);
    assert_recorded(&server, Error::NotSupported, COUNTER);
    assert_eq!(server.app().reads, 0);
}

#[test]
fn reader_failure_is_recorded() {
    let mut server = connected();
    server.app_mut().fail = Some(Error::NotReady);
    read(&mut server, COUNTER);

    assert_eq!(last_read(&server).status, GattStatus::ReadNotPermitted);
    assert_recorded(&server, Error::NotReady, COUNTER);
}

#[test]
fn error_attribute_serves_last_record() {
    let mut server = connected();
    write(&mut server, FIXED, &[1]);
    read(&mut server, ERROR);

    let reply = last_read(&server);
    assert_eq!(reply.status, GattStatus::Success);
    assert_eq!(reply.data.len(), ERROR_RECORD_SIZE);
    assert_eq!(reply.data[0] as i8, Error::InvalidRequest.code());
    assert_eq!(reply.data[1], FIXED);
}

#[test]
fn record_error_clamps_unknown_attribute() {
    let mut server = connected();
    let desc = server.record_error(Error::Io, AttrId(99));

    assert_eq!(desc.id, AttrId::ERROR);
    assert_recorded(&server, Error::Io, ERROR);
}

#[test]
fn every_request_gets_exactly_one_reply() {
    let mut server = connected();
    write(&mut server, FIXED, &[1, 2]);
    write(&mut server, FIXED, &[1]);
    write_op(&mut server, VALUE, WriteOp::PrepareRequest, 0, &[1]);
    read(&mut server, COUNTER);
    read(&mut server, EMPTY);
    read(&mut server, UNKNOWN);
    assert_eq!(server.link().replies(), 6);

    server.app_mut().defer = true;
    write(&mut server, VALUE, &[1]);
    read(&mut server, COUNTER);
    assert_eq!(server.link().replies(), 7);
    server.complete_write(ticket(&server), Ok(()));
    assert_eq!(server.link().replies(), 8);
}

// ═══════════════════════════════════════════════════════════════════════════
// Sleep Mode
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn sleep_rejects_requests_without_recording() {
    let mut server = connected();
    server.handle_event(BleEvent::Advertising(AdvEvent::Idle));
    assert!(server.entering_sleep());

    write(&mut server, FIXED, &[1, 2]);
    assert_eq!(last_write(&server).status, GattStatus::UnlikelyError);
    read(&mut server, COUNTER);
    assert_eq!(last_read(&server).status, GattStatus::UnlikelyError);

    assert_nothing_recorded(&server);
    assert_eq!(server.app().writes, 0);
    assert_eq!(server.app().reads, 0);
}

#[test]
fn idle_restarts_slow_advertising_from_baseline() {
    let mut server = started();
    server.advertising().config_mut().fast_timeout_secs = 5;
    server.handle_event(BleEvent::Advertising(AdvEvent::Slow));
    server.handle_event(BleEvent::Advertising(AdvEvent::Idle));

    let (mode, config) = *server.link().advertising.last().unwrap();
    assert_eq!(mode, AdvMode::Slow);
    assert_eq!(config, AdvertisingConfig::BASELINE);
    assert!(server.entering_sleep());
}

#[test]
fn connection_leaves_sleep() {
    let mut server = started();
    server.handle_event(BleEvent::Advertising(AdvEvent::Idle));
    server.handle_event(BleEvent::Connected { conn: CONN, peer: PEER });

    assert!(!server.entering_sleep());
    write(&mut server, FIXED, &[1, 2]);
    assert_eq!(last_write(&server).status, GattStatus::Success);
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn start_advertises_fast() {
    let server = started();
    assert_eq!(
        server.link().advertising,
        vec![(AdvMode::Fast, AdvertisingConfig::BASELINE)]
    );
}

#[test]
fn requests_without_connection_are_dropped() {
    let mut server = started();
    write(&mut server, FIXED, &[1, 2]);
    read(&mut server, COUNTER);

    assert_eq!(server.link().replies(), 0);
    assert_eq!(server.app().writes, 0);
    assert_nothing_recorded(&server);
}

#[test]
fn foreign_connection_handle_is_disconnected() {
    let mut server = connected();
    server.handle_event(BleEvent::Read(ReadRequest {
        conn: OTHER,
        uuid: AttrId(COUNTER).uuid(),
        offset: 0,
    }));

    assert_eq!(server.link().replies(), 0);
    assert_eq!(
        server.link().disconnects,
        vec![(OTHER, DisconnectReason::RemoteUserTerminated)]
    );
    assert_eq!(server.connection().handle(), Some(CONN));
}

#[test]
fn second_peer_is_turned_away() {
    let mut server = connected();
    server.handle_event(BleEvent::Connected { conn: OTHER, peer: PEER });
    server.handle_event(BleEvent::Disconnected { conn: OTHER, reason: Some(0x13) });

    assert_eq!(server.link().disconnects.len(), 1);
    assert_eq!(server.connection().handle(), Some(CONN));
}

#[test]
fn disconnection_drops_pending_and_restarts_advertising() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);
    let late = ticket(&server);

    server.handle_event(BleEvent::Disconnected { conn: CONN, reason: Some(0x13) });
    assert!(server.pending().is_none());
    assert!(!server.connection().is_connected());
    assert_eq!(server.link().advertising.last().map(|(mode, _)| *mode), Some(AdvMode::Fast));

    // A late completion has nobody to answer.
    server.complete_write(late, Ok(()));
    assert!(server.link().writes.is_empty());
}

#[test]
fn disconnection_is_idempotent() {
    let mut server = connected();
    server.handle_event(BleEvent::Disconnected { conn: CONN, reason: None });
    server.handle_event(BleEvent::Disconnected { conn: CONN, reason: None });

    assert!(!server.connection().is_connected());
    assert!(server.workers().is_enabled());
    assert_eq!(server.link().reboots, 0);
}

#[test]
fn gatt_timeout_disconnects() {
    let mut server = connected();
    server.handle_event(BleEvent::GattServerTimeout { conn: CONN });
    server.handle_event(BleEvent::GattClientTimeout { conn: CONN });

    assert_eq!(
        server.link().disconnects,
        vec![(CONN, DisconnectReason::RemoteUserTerminated)]
    );
}

#[test]
fn missing_system_attributes_are_installed() {
    let mut server = connected();
    server.handle_event(BleEvent::SysAttrMissing { conn: CONN });
    server.handle_event(BleEvent::ConnParamUpdate {
        conn: CONN,
        params: ConnParams {
            min_interval: 6,
            max_interval: 12,
            slave_latency: 3,
            sup_timeout: 200,
        },
    });

    assert_eq!(server.link().sys_attrs, vec![CONN]);
    assert!(server.link().disconnects.is_empty());
}

#[test]
fn plain_writes_refresh_activity() {
    let mut server = connected();
    for _ in 0..10 {
        server.tick();
    }
    server.handle_event(BleEvent::Written {
        conn: CONN,
        uuid: AttrUuid::bluetooth(0x2902),
    });
    assert_eq!(server.workers().last_activity(), server.workers().time());
    assert_nothing_recorded(&server);

    server.handle_event(BleEvent::Written {
        conn: CONN,
        uuid: AttrUuid::vendor(0x10FF),
    });
    assert_recorded(&server, Error::InvalidUuid, ERROR);
}

// ═══════════════════════════════════════════════════════════════════════════
// Reboot
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn reboot_waits_for_disconnection() {
    let mut server = connected();
    write(&mut server, REBOOT, &[1]);

    assert_eq!(last_write(&server).status, GattStatus::Success);
    assert_eq!(
        server.link().disconnects,
        vec![(CONN, DisconnectReason::RemoteUserTerminated)]
    );
    assert_eq!(server.link().reboots, 0);

    let adverts = server.link().advertising.len();
    server.handle_event(BleEvent::Disconnected { conn: CONN, reason: Some(0x16) });
    assert_eq!(server.link().reboots, 1);
    assert_eq!(server.link().advertising.len(), adverts);
}

#[test]
fn new_connection_cancels_reboot() {
    let mut server = started();
    server.request_reboot();
    server.handle_event(BleEvent::Connected { conn: CONN, peer: PEER });
    server.handle_event(BleEvent::Disconnected { conn: CONN, reason: None });

    assert_eq!(server.link().reboots, 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// Watchdogs
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn stalled_connection_is_closed_once() {
    let mut server = connected();
    let ticks = STALL_DELAY_SECS / WORKER_PACE_SECS;
    for _ in 0..ticks {
        server.tick();
    }
    assert!(server.link().disconnects.is_empty());

    for _ in 0..5 {
        server.tick();
    }
    assert_eq!(
        server.link().disconnects,
        vec![(CONN, DisconnectReason::RemoteUserTerminated)]
    );
    assert_eq!(DisconnectReason::RemoteUserTerminated.hci_code(), 0x13);

    // The same peer may come back right away.
    server.handle_event(BleEvent::Disconnected { conn: CONN, reason: Some(0x16) });
    server.handle_event(BleEvent::Connected { conn: CONN, peer: PEER });
    write(&mut server, FIXED, &[1, 2]);
    assert_eq!(last_write(&server).status, GattStatus::Success);
}

#[test]
fn refused_disconnect_is_retried() {
    let mut server = connected();
    server.link_mut().refuse_disconnect = true;
    for _ in 0..=STALL_DELAY_SECS / WORKER_PACE_SECS {
        server.tick();
    }
    assert_eq!(server.link().disconnects.len(), 1);
    assert!(!server.connection().is_closing());

    server.tick();
    assert_eq!(server.link().disconnects.len(), 2);

    server.link_mut().refuse_disconnect = false;
    server.tick();
    assert_eq!(server.link().disconnects.len(), 3);
    assert!(server.connection().is_closing());

    for _ in 0..5 {
        server.tick();
    }
    assert_eq!(server.link().disconnects.len(), 3);
}

#[test]
fn serviced_requests_keep_the_connection_alive() {
    let mut server = connected();
    let ticks = STALL_DELAY_SECS / WORKER_PACE_SECS;
    for _ in 0..3 {
        for _ in 0..ticks {
            server.tick();
        }
        read(&mut server, COUNTER);
    }
    assert!(server.link().disconnects.is_empty());
}

#[test]
fn stale_deferred_request_fails_internally() {
    let mut server = connected();
    server.app_mut().defer = true;
    write(&mut server, FIXED, &[7, 8]);

    let ticks = COMMAND_DELAY_SECS / WORKER_PACE_SECS;
    for _ in 0..ticks {
        server.tick();
    }
    assert!(server.link().writes.is_empty());

    server.tick();
    assert_eq!(last_write(&server).status, GattStatus::WriteNotPermitted);
    assert_recorded(&server, Error::Internal, FIXED);
    assert!(server.pending().is_none());
}

// ═══════════════════════════════════════════════════════════════════════════
// Workers
// ═══════════════════════════════════════════════════════════════════════════

fn count_run(bench: &mut Bench) -> HandlerResult {
    bench.worker_runs += 1;
    Ok(Outcome::Done)
}

fn defer_run(bench: &mut Bench) -> HandlerResult {
    bench.worker_runs += 1;
    Ok(Outcome::Deferred)
}

#[test]
fn workers_run_only_while_disconnected() {
    let mut server = AdvServer::new(REGISTRY, Bench::default(), RecordingLink::default());
    server
        .register_worker(Worker { name: "count", pace_secs: 0, run: count_run })
        .unwrap();
    server.start();

    server.tick();
    server.tick();
    assert_eq!(server.app().worker_runs, 2);

    server.handle_event(BleEvent::Connected { conn: CONN, peer: PEER });
    server.tick();
    assert_eq!(server.app().worker_runs, 2);

    server.handle_event(BleEvent::Disconnected { conn: CONN, reason: None });
    server.tick();
    assert_eq!(server.app().worker_runs, 3);
}

#[test]
fn deferred_worker_resumes_on_done() {
    let mut server = AdvServer::new(REGISTRY, Bench::default(), RecordingLink::default());
    server
        .register_worker(Worker { name: "defer", pace_secs: 0, run: defer_run })
        .unwrap();
    server
        .register_worker(Worker { name: "count", pace_secs: 0, run: count_run })
        .unwrap();
    server.start();

    server.tick();
    assert_eq!(server.app().worker_runs, 1);
    assert!(server.workers().is_running());

    server.worker_done();
    assert_eq!(server.app().worker_runs, 2);
    assert!(!server.workers().is_running());

    // Nothing left to resume.
    server.worker_done();
    assert_eq!(server.app().worker_runs, 2);
}
