//! SDO server: answers remote clients from an [`ObjectStore`].
//!
//! The server is driven from the outside. Feed it every received frame with
//! [`SdoServer::handle_frame`] and call [`SdoServer::poll`] from the main
//! loop; `poll` checks the per-channel timeouts and streams block upload
//! windows. Responses go to the [`Transport`] the server owns.
//!
//! Applications take part through observers. Read, write and domain
//! indications may answer [`Completion::Pending`]; the channel then parks in
//! [`TransferState::Suspended`] until [`SdoServer::resume`] is called.

mod block;

use log::{debug, info, trace, warn};

use crate::abort::{AbortCode, AbortReason};
use crate::channel::{Binding, ChannelId, ChannelPool, CobIds, SplitPoint, TransferState};
use crate::config::SdoConfig;
use crate::crc::Crc;
use crate::error::SdoError;
use crate::frame::{
    self, ClientCommand, Frame, ObjectAddress, ServerCommand, BLOCK_SUB_END, BLOCK_SUB_MASK,
    BLOCK_SUB_ACK, BLOCK_SUB_INIT, BLOCK_SUB_START, EXPEDITED_FLAG, EXPEDITED_MAX_LEN,
    LAST_SEGMENT_FLAG, SEGMENT_DATA_LEN, SIZE_INDICATED_FLAG, TOGGLE_BIT,
};
use crate::indication::{Completion, IndicationResult, ObserverId, Observers};
use crate::store::{ObjectInfo, ObjectStore};
use crate::timer::{Clock, Timer};
use crate::transport::Transport;

/// Transfer an indication is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerRequest {
    pub channel: ChannelId,
    pub address: ObjectAddress,
}

/// Slice of a domain transfer exchanged through the staging chunk.
///
/// For reads the application stages bytes `offset..offset + len` of the
/// value at chunk position 0. For writes the chunk holds those bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainChunk {
    pub channel: ChannelId,
    pub address: ObjectAddress,
    pub offset: usize,
    pub len: usize,
    /// No chunk follows.
    pub last: bool,
}

pub type ReadHook<S> = dyn FnMut(&ServerRequest, &mut S) -> IndicationResult;
/// Called with the declared length and, for expedited writes, the value.
pub type CheckWriteHook = dyn FnMut(&ServerRequest, usize, Option<&[u8]>) -> Result<(), AbortReason>;
pub type WriteHook<S> = dyn FnMut(&ServerRequest, &mut S) -> IndicationResult;
pub type DomainHook<S> = dyn FnMut(&DomainChunk, &mut S) -> IndicationResult;
pub type AbortHook = dyn FnMut(&ServerRequest, AbortCode);

struct Hooks<S> {
    read: Observers<ReadHook<S>>,
    check_write: Observers<CheckWriteHook>,
    write: Observers<WriteHook<S>>,
    domain_read: Observers<DomainHook<S>>,
    domain_write: Observers<DomainHook<S>>,
    abort: Observers<AbortHook>,
    next_id: u32,
}

impl<S> Hooks<S> {
    fn new() -> Self {
        Self {
            next_id: 0,
            read: Observers::new(),
            check_write: Observers::new(),
            write: Observers::new(),
            domain_read: Observers::new(),
            domain_write: Observers::new(),
            abort: Observers::new(),
        }
    }

    fn next_id(&mut self) -> ObserverId {
        self.next_id = self.next_id.wrapping_add(1);
        ObserverId(self.next_id)
    }

    fn remove(&mut self, id: ObserverId) -> bool {
        self.read.remove(id)
            || self.check_write.remove(id)
            || self.write.remove(id)
            || self.domain_read.remove(id)
            || self.domain_write.remove(id)
            || self.abort.remove(id)
    }
}

/// Everything a channel needs from its server while handling one event.
struct Ctx<'a, T, S> {
    transport: &'a mut T,
    store: &'a mut S,
    hooks: &'a mut Hooks<S>,
    config: &'a SdoConfig,
    now: u64,
}

impl<T: Transport, S: ObjectStore> Ctx<'_, T, S> {
    fn indicate_read(&mut self, request: &ServerRequest) -> IndicationResult {
        let store = &mut *self.store;
        self.hooks.read.consult(|f| f(request, &mut *store))
    }

    fn indicate_write(&mut self, request: &ServerRequest) -> IndicationResult {
        let store = &mut *self.store;
        self.hooks.write.consult(|f| f(request, &mut *store))
    }

    fn check_write(&mut self, request: &ServerRequest, len: usize, value: Option<&[u8]>) -> Result<(), AbortReason> {
        self.hooks.check_write.veto(|f| f(request, len, value))
    }

    fn domain_read(&mut self, chunk: &DomainChunk) -> IndicationResult {
        let store = &mut *self.store;
        self.hooks.domain_read.consult(|f| f(chunk, &mut *store))
    }

    fn domain_write(&mut self, chunk: &DomainChunk) -> IndicationResult {
        let store = &mut *self.store;
        self.hooks.domain_write.consult(|f| f(chunk, &mut *store))
    }
}

impl<T, S> Ctx<'_, T, S> {
    fn timeout_us(&self) -> u64 {
        self.config.server_timeout_ms as u64 * 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Expedited,
    Segmented,
    Block,
}

/// Steps left once all data of a write has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStage {
    Drain,
    Commit,
    Indicate,
    Respond,
}

/// Value of a small object before a write, put back if the write fails.
#[derive(Debug, Clone, Copy)]
struct Saved {
    bytes: [u8; EXPEDITED_MAX_LEN],
    size: usize,
}

struct ServerChannel {
    id: ChannelId,
    binding: Binding,
    state: TransferState,
    address: ObjectAddress,
    info: ObjectInfo,
    toggle: u8,
    /// Size of the value being transferred.
    total: usize,
    /// Bytes transferred so far.
    cursor: usize,
    size_indicated: bool,
    chunk_base: usize,
    chunk_ready: bool,
    /// Non-domain writes collect here until they are complete.
    staging: Vec<u8>,
    saved: Option<Saved>,
    mode: WriteMode,
    stage: Option<WriteStage>,
    block_size: u8,
    /// Last sequence number sent or accepted in the current window.
    seq: u8,
    window_start: usize,
    last_sent: bool,
    last_segment: Option<[u8; SEGMENT_DATA_LEN]>,
    crc_enabled: bool,
    crc: Crc,
    timer: Timer,
}

impl ServerChannel {
    fn new(id: ChannelId, binding: Binding) -> Self {
        Self {
            id,
            binding,
            state: TransferState::Free,
            address: ObjectAddress::new(0, 0),
            info: ObjectInfo::default(),
            toggle: 0,
            total: 0,
            cursor: 0,
            size_indicated: true,
            chunk_base: 0,
            chunk_ready: false,
            staging: Vec::new(),
            saved: None,
            mode: WriteMode::Expedited,
            stage: None,
            block_size: 0,
            seq: 0,
            window_start: 0,
            last_sent: false,
            last_segment: None,
            crc_enabled: false,
            crc: Crc::new(),
            timer: Timer::new(),
        }
    }

    fn request(&self) -> ServerRequest {
        ServerRequest {
            channel: self.id,
            address: self.address,
        }
    }

    fn begin(&mut self, address: ObjectAddress, info: ObjectInfo) {
        self.address = address;
        self.info = info;
        self.toggle = 0;
        self.total = info.size;
        self.cursor = 0;
        self.size_indicated = true;
        self.chunk_base = 0;
        self.chunk_ready = false;
        self.staging.clear();
        self.saved = None;
        self.stage = None;
        self.seq = 0;
        self.window_start = 0;
        self.last_sent = false;
        self.last_segment = None;
        self.crc.reset();
    }

    fn release(&mut self) {
        self.state = TransferState::Free;
        self.stage = None;
        self.last_segment = None;
        self.timer.stop();
    }

    fn suspend(&mut self, point: SplitPoint) {
        trace!("SDO server {}: waiting for application at {:?}", self.id, point);
        self.state = TransferState::Suspended(point);
        self.timer.stop();
    }

    /// Restart the step timeout while a transfer is in flight.
    fn touch<T, S>(&mut self, ctx: &Ctx<'_, T, S>) {
        match self.state {
            TransferState::Free | TransferState::Suspended(_) => self.timer.stop(),
            _ if ctx.config.server_timeout_ms > 0 => self.timer.start(ctx.now, ctx.timeout_us()),
            _ => {}
        }
    }

    fn send<T: Transport, S>(&mut self, ctx: &mut Ctx<'_, T, S>, frame: &Frame) -> Result<(), AbortReason> {
        let tx = self.binding.tx().ok_or(AbortReason::General)?;
        trace!("SDO server {} tx 0x{:03X} {:02X?}", self.id, tx, frame);
        ctx.transport.send(tx, frame).map_err(|e| {
            warn!("SDO server {}: response on 0x{:03X} not sent: {}", self.id, tx, e);
            AbortReason::OutOfMemory
        })?;
        self.touch(ctx);
        Ok(())
    }

    /// Terminate the transfer locally: abort frame, rollback, indication.
    fn fail<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, reason: AbortReason) {
        let code = reason.code();
        let active = !self.state.is_free();
        warn!("SDO server {}: abort {} on {}", self.id, code, self.address);
        if let Some(tx) = self.binding.tx() {
            if let Err(e) = ctx.transport.send(tx, &frame::abort(self.address, code)) {
                warn!("SDO server {}: abort frame not sent: {}", self.id, e);
            }
        }
        self.restore(ctx);
        self.release();
        if active {
            let request = self.request();
            ctx.hooks.abort.notify(|f| f(&request, code));
        }
    }

    fn peer_abort<T, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, code: AbortCode) {
        if self.state.is_free() {
            return;
        }
        info!("SDO server {}: client aborted {} with {}", self.id, self.address, code);
        self.restore(ctx);
        self.release();
        let request = self.request();
        ctx.hooks.abort.notify(|f| f(&request, code));
    }

    fn restore<T, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>) {
        if let Some(saved) = self.saved.take() {
            let restored = ctx
                .store
                .write(self.address, 0, &saved.bytes[..saved.size])
                .and_then(|()| ctx.store.set_size(self.address, saved.size));
            if let Err(reason) = restored {
                warn!("SDO server {}: could not restore {}: {}", self.id, self.address, reason);
            }
        }
    }

    fn on_frame<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, frame: &Frame) -> Result<(), AbortReason> {
        if frame::is_abort(frame) {
            self.peer_abort(ctx, frame::abort_code(frame));
            return Ok(());
        }
        // Sub-block segments carry a sequence number instead of a command
        if self.state == TransferState::BlockDownloadBlock {
            return self.receive_block_segment(ctx, frame);
        }
        if self.state.is_free() {
            self.address = ObjectAddress::decode(frame);
        }

        let command = frame[0];
        match ClientCommand::parse(command) {
            Some(ClientCommand::InitiateUpload) => self.upload_init(ctx, frame),
            Some(ClientCommand::UploadSegment) => self.upload_segment(ctx, frame),
            Some(ClientCommand::InitiateDownload) => self.download_init(ctx, frame),
            Some(ClientCommand::DownloadSegment) => self.download_segment(ctx, frame),
            Some(ClientCommand::BlockUpload) => match command & BLOCK_SUB_MASK {
                BLOCK_SUB_INIT => self.block_upload_init(ctx, frame),
                BLOCK_SUB_START => self.block_upload_start(),
                BLOCK_SUB_ACK => self.block_upload_ack(ctx, frame),
                _ => self.block_upload_end(),
            },
            Some(ClientCommand::BlockDownload) => match command & BLOCK_SUB_END {
                0 => self.block_download_init(ctx, frame),
                _ => self.block_download_end(ctx, frame),
            },
            Some(ClientCommand::Abort) | None => Err(AbortReason::UnknownCommand),
        }
    }

    /// Claim the channel for a new transfer of the addressed object.
    fn open<S: ObjectStore>(&mut self, store: &S, frame: &Frame, write: bool) -> Result<(), AbortReason> {
        if !self.state.is_free() {
            return Err(AbortReason::ServiceBusy);
        }
        let address = ObjectAddress::decode(frame);
        self.address = address;
        let info = store.describe(address)?;
        if write && !info.access.write {
            return Err(AbortReason::NoWritePermission);
        }
        if !write && !info.access.read {
            return Err(AbortReason::NoReadPermission);
        }
        self.begin(address, info);
        debug!(
            "SDO server {}: {} {} ({} bytes)",
            self.id,
            if write { "write" } else { "read" },
            address,
            info.size
        );
        Ok(())
    }

    fn read_object<S: ObjectStore>(&self, store: &mut S, offset: usize, buf: &mut [u8]) -> Result<(), AbortReason> {
        let at = if self.info.domain { offset - self.chunk_base } else { offset };
        store.read(self.address, at, buf)
    }

    /// Ask for the next domain chunk if the current one is used up.
    fn refill_chunk<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, span: usize) -> IndicationResult {
        if !self.info.domain || self.chunk_ready {
            return Ok(Completion::Ready);
        }
        self.chunk_base = self.cursor;
        self.chunk_ready = true;
        let len = span.min(self.total - self.cursor);
        let chunk = DomainChunk {
            channel: self.id,
            address: self.address,
            offset: self.cursor,
            len,
            last: self.cursor + len == self.total,
        };
        ctx.domain_read(&chunk)
    }

    fn upload_init<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, frame: &Frame) -> Result<(), AbortReason> {
        self.open(&*ctx.store, frame, false)?;
        self.state = TransferState::UploadInit;
        let request = self.request();
        if ctx.indicate_read(&request)? == Completion::Pending {
            self.suspend(SplitPoint::UploadInit);
            return Ok(());
        }
        self.continue_upload_init(ctx)
    }

    fn continue_upload_init<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>) -> Result<(), AbortReason> {
        self.state = TransferState::UploadInit;
        let span = ctx.config.domain_chunk_len();
        if self.refill_chunk(ctx, span)? == Completion::Pending {
            self.suspend(SplitPoint::UploadInit);
            return Ok(());
        }

        if self.total == 0 || self.total > EXPEDITED_MAX_LEN {
            let mut response = frame::with_address(
                ServerCommand::InitiateUpload as u8 | SIZE_INDICATED_FLAG,
                self.address,
            );
            frame::set_size_field(&mut response, self.total as u32);
            self.state = TransferState::UploadSegment;
            return self.send(ctx, &response);
        }

        let mut value = [0u8; EXPEDITED_MAX_LEN];
        let len = self.total;
        self.read_object(ctx.store, 0, &mut value[..len])?;
        let response = frame::expedited(ServerCommand::InitiateUpload as u8, self.address, &value[..len]);
        self.release();
        debug!("SDO server {}: expedited read of {} done", self.id, self.address);
        self.send(ctx, &response)
    }

    fn upload_segment<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, frame: &Frame) -> Result<(), AbortReason> {
        if self.state != TransferState::UploadSegment {
            return Err(AbortReason::UnknownCommand);
        }
        if frame[0] & TOGGLE_BIT != self.toggle {
            return Err(AbortReason::ToggleMismatch);
        }
        if self.info.domain && self.cursor - self.chunk_base >= ctx.config.domain_chunk_len() {
            self.chunk_ready = false;
        }
        self.continue_upload_segment(ctx)
    }

    fn continue_upload_segment<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>) -> Result<(), AbortReason> {
        self.state = TransferState::UploadSegment;
        let span = ctx.config.domain_chunk_len();
        if self.refill_chunk(ctx, span)? == Completion::Pending {
            self.suspend(SplitPoint::UploadSegment);
            return Ok(());
        }

        let len = SEGMENT_DATA_LEN.min(self.total - self.cursor);
        let mut data = [0u8; SEGMENT_DATA_LEN];
        self.read_object(ctx.store, self.cursor, &mut data[..len])?;
        let last = self.cursor + len == self.total;
        let response = frame::segment(ServerCommand::UploadSegment as u8, self.toggle, &data[..len], last);
        self.cursor += len;
        self.toggle ^= TOGGLE_BIT;
        if last {
            self.release();
            debug!("SDO server {}: segmented read of {} done", self.id, self.address);
        }
        self.send(ctx, &response)
    }

    /// Declared write length against the object's limits.
    fn check_declared(&self, len: usize) -> Result<(), AbortReason> {
        if len > self.info.max_size || (self.info.numeric && len != self.info.max_size) {
            debug!(
                "SDO server {}: {} bytes declared for {} (max {})",
                self.id, len, self.address, self.info.max_size
            );
            return Err(AbortReason::DataTypeMismatch);
        }
        Ok(())
    }

    /// Take received write data. Domains go straight to the store chunk.
    fn accept_data<S: ObjectStore>(&mut self, store: &mut S, data: &[u8]) -> Result<(), AbortReason> {
        if self.cursor + data.len() > self.total {
            return Err(AbortReason::DataTypeMismatch);
        }
        if self.info.domain {
            store.write(self.address, self.cursor - self.chunk_base, data)?;
        } else {
            self.staging.extend_from_slice(data);
        }
        self.cursor += data.len();
        Ok(())
    }

    fn drain_chunk<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, last: bool) -> IndicationResult {
        let chunk = DomainChunk {
            channel: self.id,
            address: self.address,
            offset: self.chunk_base,
            len: self.cursor - self.chunk_base,
            last,
        };
        self.chunk_base = self.cursor;
        ctx.domain_write(&chunk)
    }

    fn download_init<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, frame: &Frame) -> Result<(), AbortReason> {
        self.open(&*ctx.store, frame, true)?;
        let command = frame[0];
        let expedited = command & EXPEDITED_FLAG != 0;
        let len = match (expedited, command & SIZE_INDICATED_FLAG != 0) {
            (true, true) => frame::expedited_len(command),
            (true, false) => self.info.max_size,
            (false, true) => frame::size_field(frame) as usize,
            (false, false) => return Err(AbortReason::UnknownCommand),
        };
        if expedited && len > EXPEDITED_MAX_LEN {
            return Err(AbortReason::DataTypeMismatch);
        }
        self.check_declared(len)?;
        let request = self.request();
        ctx.check_write(&request, len, expedited.then(|| &frame[4..4 + len]))?;
        self.total = len;

        if expedited {
            self.accept_data(ctx.store, &frame[4..4 + len])?;
            self.mode = WriteMode::Expedited;
            self.state = TransferState::DownloadInit;
            self.stage = Some(WriteStage::Drain);
            return self.complete_write(ctx);
        }

        self.mode = WriteMode::Segmented;
        self.state = TransferState::DownloadSegment;
        self.send(ctx, &frame::with_address(ServerCommand::InitiateDownload as u8, self.address))
    }

    fn download_segment<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, frame: &Frame) -> Result<(), AbortReason> {
        if self.state != TransferState::DownloadSegment {
            return Err(AbortReason::UnknownCommand);
        }
        let command = frame[0];
        if command & TOGGLE_BIT != self.toggle {
            return Err(AbortReason::ToggleMismatch);
        }
        let len = frame::segment_len(command);
        self.accept_data(ctx.store, &frame[1..1 + len])?;

        if command & LAST_SEGMENT_FLAG != 0 {
            if self.cursor != self.total {
                return Err(AbortReason::DataTypeMismatch);
            }
            self.stage = Some(WriteStage::Drain);
            return self.complete_write(ctx);
        }
        if self.info.domain
            && self.cursor - self.chunk_base >= ctx.config.domain_chunk_len()
            && self.drain_chunk(ctx, false)? == Completion::Pending
        {
            self.suspend(SplitPoint::DownloadSegment);
            return Ok(());
        }
        self.acknowledge_segment(ctx)
    }

    fn acknowledge_segment<T: Transport, S>(&mut self, ctx: &mut Ctx<'_, T, S>) -> Result<(), AbortReason> {
        let mut response = [0u8; 8];
        response[0] = ServerCommand::DownloadSegment as u8 | self.toggle;
        self.toggle ^= TOGGLE_BIT;
        self.state = TransferState::DownloadSegment;
        self.send(ctx, &response)
    }

    /// Finish a write whose data is complete. Picks up where a deferred
    /// indication left off.
    fn complete_write<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>) -> Result<(), AbortReason> {
        let split = match self.mode {
            WriteMode::Expedited => SplitPoint::DownloadInit,
            WriteMode::Segmented => SplitPoint::DownloadSegment,
            WriteMode::Block => SplitPoint::BlockDownloadEnd,
        };
        while let Some(stage) = self.stage {
            match stage {
                WriteStage::Drain => {
                    self.stage = Some(WriteStage::Commit);
                    if self.info.domain && self.drain_chunk(ctx, true)? == Completion::Pending {
                        self.suspend(split);
                        return Ok(());
                    }
                }
                WriteStage::Commit => {
                    self.commit(ctx.store)?;
                    self.stage = Some(WriteStage::Indicate);
                }
                WriteStage::Indicate => {
                    self.stage = Some(WriteStage::Respond);
                    let request = self.request();
                    if ctx.indicate_write(&request)? == Completion::Pending {
                        self.suspend(split);
                        return Ok(());
                    }
                }
                WriteStage::Respond => {
                    self.stage = None;
                    return self.respond_write(ctx);
                }
            }
        }
        Ok(())
    }

    fn commit<S: ObjectStore>(&mut self, store: &mut S) -> Result<(), AbortReason> {
        if !self.info.domain {
            store.check_limits(self.address, &self.staging)?;
            if self.info.max_size <= EXPEDITED_MAX_LEN {
                let mut saved = Saved {
                    bytes: [0; EXPEDITED_MAX_LEN],
                    size: self.info.size.min(EXPEDITED_MAX_LEN),
                };
                store.read(self.address, 0, &mut saved.bytes[..saved.size])?;
                self.saved = Some(saved);
            }
            store.write(self.address, 0, &self.staging)?;
        }
        store.set_size(self.address, self.cursor)
    }

    fn respond_write<T: Transport, S>(&mut self, ctx: &mut Ctx<'_, T, S>) -> Result<(), AbortReason> {
        let response = match self.mode {
            WriteMode::Expedited => frame::with_address(ServerCommand::InitiateDownload as u8, self.address),
            WriteMode::Segmented => [ServerCommand::DownloadSegment as u8 | self.toggle, 0, 0, 0, 0, 0, 0, 0],
            WriteMode::Block => [ServerCommand::BlockDownload as u8 | BLOCK_SUB_END, 0, 0, 0, 0, 0, 0, 0],
        };
        self.saved = None;
        self.release();
        debug!("SDO server {}: wrote {} bytes to {}", self.id, self.cursor, self.address);
        self.send(ctx, &response)
    }

    fn resume<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>, point: SplitPoint) -> Result<(), AbortReason> {
        match point {
            SplitPoint::UploadInit => self.continue_upload_init(ctx),
            SplitPoint::UploadSegment => self.continue_upload_segment(ctx),
            SplitPoint::BlockUploadInit => self.respond_block_upload_init(ctx),
            SplitPoint::BlockUploadWindow => {
                self.state = TransferState::BlockUploadBlock;
                Ok(())
            }
            SplitPoint::DownloadInit | SplitPoint::BlockDownloadEnd => self.complete_write(ctx),
            SplitPoint::DownloadSegment if self.stage.is_some() => self.complete_write(ctx),
            SplitPoint::DownloadSegment => self.acknowledge_segment(ctx),
            SplitPoint::BlockDownloadAck => self.send_block_ack(ctx),
            SplitPoint::DomainWrite => Err(AbortReason::General),
        }
    }
}

/// SDO server serving one node's object dictionary.
pub struct SdoServer<T, S, C> {
    config: SdoConfig,
    channels: ChannelPool<ServerChannel>,
    hooks: Hooks<S>,
    transport: T,
    store: S,
    clock: C,
}

impl<T: Transport, S: ObjectStore, C: Clock> SdoServer<T, S, C> {
    /// Channel 0 is bound to the predefined connection of `node_id`, other
    /// channels stay disabled until [`SdoServer::set_cob_ids`].
    pub fn new(config: SdoConfig, node_id: u8, transport: T, store: S, clock: C) -> Result<Self, SdoError> {
        config.validate()?;
        if node_id == 0 || node_id > 127 {
            return Err(SdoError::Config(format!("node id {} outside 1..=127", node_id)));
        }
        let channels = ChannelPool::new(config.server_channels, |id| {
            let binding = if id.0 == 0 {
                Binding::bound(CobIds::server(node_id))
            } else {
                Binding::UNBOUND
            };
            ServerChannel::new(id, binding)
        });
        info!("SDO server for node {} with {} channel(s)", node_id, channels.len());
        Ok(Self {
            config,
            channels,
            hooks: Hooks::new(),
            transport,
            store,
            clock,
        })
    }

    /// Process a received frame. Returns false if no enabled channel
    /// listens on `cob_id`.
    pub fn handle_frame(&mut self, cob_id: u16, frame: &Frame) -> bool {
        let Some(id) = self.channels.find(|c| c.binding.accepts(cob_id)) else {
            return false;
        };
        trace!("SDO server {} rx 0x{:03X} {:02X?}", id, cob_id, frame);
        let now = self.clock.now_us();
        let Ok(channel) = self.channels.get_mut(id) else {
            return false;
        };
        let mut ctx = Ctx {
            transport: &mut self.transport,
            store: &mut self.store,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        match channel.on_frame(&mut ctx, frame) {
            Ok(()) => channel.touch(&ctx),
            Err(reason) => channel.fail(&mut ctx, reason),
        }
        true
    }

    /// Check timeouts and stream pending block upload windows.
    pub fn poll(&mut self) {
        let now = self.clock.now_us();
        let mut ctx = Ctx {
            transport: &mut self.transport,
            store: &mut self.store,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        for channel in self.channels.iter_mut() {
            if channel.timer.poll(now) {
                warn!("SDO server {}: transfer of {} timed out", channel.id, channel.address);
                channel.fail(&mut ctx, AbortReason::Timeout);
                continue;
            }
            if channel.state == TransferState::BlockUploadBlock {
                if let Err(reason) = channel.stream_block(&mut ctx) {
                    channel.fail(&mut ctx, reason);
                }
            }
        }
    }

    /// Continue a transfer parked by a deferred indication. An error result
    /// aborts the transfer with that reason.
    pub fn resume(&mut self, id: ChannelId, result: Result<(), AbortReason>) -> Result<(), SdoError> {
        let now = self.clock.now_us();
        let channel = self.channels.get_mut(id)?;
        let TransferState::Suspended(point) = channel.state else {
            return Err(SdoError::NotSuspended(id));
        };
        let mut ctx = Ctx {
            transport: &mut self.transport,
            store: &mut self.store,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        match result.and_then(|()| channel.resume(&mut ctx, point)) {
            Ok(()) => channel.touch(&ctx),
            Err(reason) => channel.fail(&mut ctx, reason),
        }
        Ok(())
    }

    /// Abort the running transfer of a channel.
    pub fn abort(&mut self, id: ChannelId, reason: AbortReason) -> Result<(), SdoError> {
        let now = self.clock.now_us();
        let channel = self.channels.get_mut(id)?;
        if channel.state.is_free() {
            return Err(SdoError::NotActive(id));
        }
        let mut ctx = Ctx {
            transport: &mut self.transport,
            store: &mut self.store,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        channel.fail(&mut ctx, reason);
        Ok(())
    }

    pub fn state(&self, id: ChannelId) -> Result<TransferState, SdoError> {
        self.channels.get(id).map(|c| c.state)
    }

    /// Rebind a channel. Fails while a transfer is running on it.
    pub fn set_cob_ids(&mut self, id: ChannelId, cob: CobIds) -> Result<(), SdoError> {
        let channel = self.channels.get_mut(id)?;
        if !channel.state.is_free() {
            return Err(SdoError::Busy(id));
        }
        channel.binding = Binding::bound(cob);
        Ok(())
    }

    pub fn set_enabled(&mut self, id: ChannelId, enabled: bool) -> Result<(), SdoError> {
        let channel = self.channels.get_mut(id)?;
        if !channel.state.is_free() {
            return Err(SdoError::Busy(id));
        }
        if enabled && channel.binding.cob.is_none() {
            return Err(SdoError::Disabled(id));
        }
        channel.binding.enabled = enabled;
        Ok(())
    }

    /// Observers run in registration order. Every read observer is asked;
    /// if any answers [`Completion::Pending`] the transfer waits for one
    /// [`SdoServer::resume`]. An observer that refuses ends the transfer,
    /// and the abort observers are notified afterwards.
    pub fn on_read(&mut self, hook: impl FnMut(&ServerRequest, &mut S) -> IndicationResult + 'static) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.read.register(id, Box::new(hook));
        id
    }

    /// Veto writes before any data is accepted.
    pub fn on_check_write(
        &mut self,
        hook: impl FnMut(&ServerRequest, usize, Option<&[u8]>) -> Result<(), AbortReason> + 'static,
    ) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.check_write.register(id, Box::new(hook));
        id
    }

    /// Called once the value is committed. Deferral and refusal work as for
    /// [`SdoServer::on_read`]; a refusal or a failed resume restores the old
    /// value of small objects before the abort observers run.
    pub fn on_write(&mut self, hook: impl FnMut(&ServerRequest, &mut S) -> IndicationResult + 'static) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.write.register(id, Box::new(hook));
        id
    }

    /// Stage the next chunk of a domain read into the store.
    pub fn on_domain_read(&mut self, hook: impl FnMut(&DomainChunk, &mut S) -> IndicationResult + 'static) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.domain_read.register(id, Box::new(hook));
        id
    }

    /// Consume a chunk of a domain write from the store.
    pub fn on_domain_write(&mut self, hook: impl FnMut(&DomainChunk, &mut S) -> IndicationResult + 'static) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.domain_write.register(id, Box::new(hook));
        id
    }

    /// Called once for every transfer that ends in an abort, whichever side
    /// aborted. This comes after any read or write observer that already
    /// ran for the transfer, so a refused write is seen twice: first by the
    /// write observers, then here with the abort code.
    pub fn on_abort(&mut self, hook: impl FnMut(&ServerRequest, AbortCode) + 'static) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.abort.register(id, Box::new(hook));
        id
    }

    /// Unregister an observer. Returns false if `id` is not registered.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.hooks.remove(id)
    }

    pub fn config(&self) -> &SdoConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Access, MemoryStore};
    use crate::timer::ManualClock;
    use crate::transport::FrameQueue;

    const NODE: u8 = 4;
    const RX: u16 = 0x604;
    const TX: u16 = 0x584;
    const IDENTITY: ObjectAddress = ObjectAddress::new(0x1018, 1);
    const NAME: ObjectAddress = ObjectAddress::new(0x1008, 0);

    fn server() -> SdoServer<FrameQueue, MemoryStore, ManualClock> {
        let mut store = MemoryStore::new();
        store.insert_numeric(IDENTITY, &0xAABB_CCDDu32.to_le_bytes(), Access::READ_WRITE);
        store.insert(NAME, b"mock node", 32, Access::READ_WRITE);
        SdoServer::new(SdoConfig::default(), NODE, FrameQueue::new(64), store, ManualClock::new()).unwrap()
    }

    fn reply(server: &mut SdoServer<FrameQueue, MemoryStore, ManualClock>) -> Frame {
        let (cob, frame) = server.transport_mut().pop().expect("no response");
        assert_eq!(cob, TX);
        frame
    }

    #[test]
    fn expedited_read() {
        let mut server = server();
        assert!(server.handle_frame(RX, &[0x40, 0x18, 0x10, 0x01, 0, 0, 0, 0]));
        assert_eq!(reply(&mut server), [0x43, 0x18, 0x10, 0x01, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(server.state(ChannelId(0)).unwrap(), TransferState::Free);
    }

    #[test]
    fn foreign_cob_id_is_not_consumed() {
        let mut server = server();
        assert!(!server.handle_frame(0x605, &[0x40, 0x18, 0x10, 0x01, 0, 0, 0, 0]));
        assert!(server.transport().is_empty());
    }

    #[test]
    fn unknown_object_aborts() {
        let mut server = server();
        server.handle_frame(RX, &[0x40, 0x00, 0x20, 0x00, 0, 0, 0, 0]);
        let response = reply(&mut server);
        assert!(frame::is_abort(&response));
        assert_eq!(frame::abort_code(&response), AbortReason::ObjectNotFound.code());
    }

    #[test]
    fn wrong_size_numeric_write_keeps_value() {
        let mut server = server();
        server.handle_frame(RX, &[0x2B, 0x18, 0x10, 0x01, 0x01, 0x02, 0, 0]);
        let response = reply(&mut server);
        assert_eq!(frame::abort_code(&response), AbortReason::DataTypeMismatch.code());
        assert_eq!(server.store().value(IDENTITY), Some(&0xAABB_CCDDu32.to_le_bytes()[..]));
    }

    #[test]
    fn failed_write_indication_restores_old_value() {
        let mut server = server();
        server.on_write(|_, _| Err(AbortReason::LocalControl));
        server.handle_frame(RX, &[0x23, 0x18, 0x10, 0x01, 1, 2, 3, 4]);
        let response = reply(&mut server);
        assert_eq!(frame::abort_code(&response), AbortReason::LocalControl.code());
        assert_eq!(server.store().value(IDENTITY), Some(&0xAABB_CCDDu32.to_le_bytes()[..]));
    }

    #[test]
    fn refused_write_reaches_abort_observers_last() {
        let mut server = server();
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = log.clone();
        server.on_write(move |_, _| {
            sink.borrow_mut().push("write".to_string());
            Err(AbortReason::LocalControl)
        });
        let sink = log.clone();
        server.on_abort(move |request, code| sink.borrow_mut().push(format!("abort {} {}", request.address, code)));
        server.handle_frame(RX, &[0x23, 0x18, 0x10, 0x01, 1, 2, 3, 4]);
        assert_eq!(
            *log.borrow(),
            vec!["write".to_string(), format!("abort {} {}", IDENTITY, AbortReason::LocalControl.code())]
        );
    }

    #[test]
    fn removed_observer_is_skipped() {
        let mut server = server();
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let seen = calls.clone();
        let id = server.on_read(move |_, _| {
            seen.set(seen.get() + 1);
            Ok(Completion::Ready)
        });
        let other = server.on_abort(|_, _| {});
        assert_ne!(id, other);
        assert!(server.remove_observer(id));
        assert!(!server.remove_observer(id));

        server.handle_frame(RX, &[0x40, 0x18, 0x10, 0x01, 0, 0, 0, 0]);
        assert_eq!(reply(&mut server)[0], 0x43);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn check_write_veto() {
        let mut server = server();
        server.on_check_write(|_, len, value| {
            assert_eq!(len, 4);
            assert_eq!(value, Some(&[1u8, 2, 3, 4][..]));
            Err(AbortReason::DeviceState)
        });
        server.handle_frame(RX, &[0x23, 0x18, 0x10, 0x01, 1, 2, 3, 4]);
        assert_eq!(frame::abort_code(&reply(&mut server)), AbortReason::DeviceState.code());
    }

    #[test]
    fn deferred_read_resumes() {
        let mut server = server();
        server.on_read(|_, _| Ok(Completion::Pending));
        server.handle_frame(RX, &[0x40, 0x18, 0x10, 0x01, 0, 0, 0, 0]);
        assert!(server.transport().is_empty());
        assert_eq!(
            server.state(ChannelId(0)).unwrap(),
            TransferState::Suspended(SplitPoint::UploadInit)
        );
        server.resume(ChannelId(0), Ok(())).unwrap();
        assert_eq!(reply(&mut server)[0], 0x43);
        assert!(matches!(server.resume(ChannelId(0), Ok(())), Err(SdoError::NotSuspended(_))));
    }

    #[test]
    fn segmented_read_toggles() {
        let mut server = server();
        server.handle_frame(RX, &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
        assert_eq!(reply(&mut server), [0x41, 0x08, 0x10, 0x00, 9, 0, 0, 0]);
        server.handle_frame(RX, &[0x60, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(reply(&mut server), [0x00, b'm', b'o', b'c', b'k', b' ', b'n', b'o']);
        server.handle_frame(RX, &[0x70, 0, 0, 0, 0, 0, 0, 0]);
        let last = reply(&mut server);
        assert_eq!(last[0], 0x10 | (5 << 1) | 0x01);
        assert_eq!(&last[1..3], b"de");
        assert!(server.state(ChannelId(0)).unwrap().is_free());
    }

    #[test]
    fn repeated_toggle_aborts() {
        let mut server = server();
        server.handle_frame(RX, &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
        server.handle_frame(RX, &[0x60, 0, 0, 0, 0, 0, 0, 0]);
        server.transport_mut().drain().count();
        server.handle_frame(RX, &[0x60, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(frame::abort_code(&reply(&mut server)), AbortReason::ToggleMismatch.code());
        assert!(server.state(ChannelId(0)).unwrap().is_free());
    }

    #[test]
    fn idle_transfer_times_out() {
        let clock = ManualClock::new();
        let mut store = MemoryStore::new();
        store.insert(NAME, b"mock node", 32, Access::READ_WRITE);
        let mut server =
            SdoServer::new(SdoConfig::default(), NODE, FrameQueue::new(8), store, clock.clone()).unwrap();
        let aborted = std::rc::Rc::new(std::cell::Cell::new(None));
        let seen = aborted.clone();
        server.on_abort(move |_, code| seen.set(Some(code)));
        server.handle_frame(RX, &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
        server.transport_mut().drain().count();
        clock.advance_ms(999);
        server.poll();
        assert!(server.transport().is_empty());
        clock.advance_ms(1);
        server.poll();
        assert_eq!(frame::abort_code(&reply(&mut server)), AbortReason::Timeout.code());
        assert_eq!(aborted.get(), Some(AbortReason::Timeout.code()));
    }

    #[test]
    fn client_abort_frees_channel_silently() {
        let mut server = server();
        server.handle_frame(RX, &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
        server.transport_mut().drain().count();
        server.handle_frame(RX, &frame::abort(NAME, AbortReason::General.code()));
        assert!(server.transport().is_empty());
        assert!(server.state(ChannelId(0)).unwrap().is_free());
    }

    #[test]
    fn abort_api_needs_active_transfer() {
        let mut server = server();
        assert!(matches!(server.abort(ChannelId(0), AbortReason::General), Err(SdoError::NotActive(_))));
        assert!(matches!(server.state(ChannelId(3)), Err(SdoError::InvalidChannel(_))));
    }
}
