//! SDO client: reads and writes objects of remote servers.
//!
//! Each request runs on one client channel bound to a server. The client
//! picks the protocol from the size: expedited up to 4 bytes, block mode
//! from [`SdoConfig::block_threshold`] on, segmented otherwise. Every
//! started transfer ends with exactly one read or write indication.

mod block;

use log::{debug, info, trace, warn};

use crate::abort::{AbortCode, AbortReason};
use crate::channel::{Binding, ChannelId, ChannelPool, CobIds, SplitPoint, TransferState};
use crate::config::SdoConfig;
use crate::crc::Crc;
use crate::error::SdoError;
use crate::frame::{
    self, ClientCommand, Frame, ObjectAddress, ServerCommand, BLOCK_CRC_FLAG, BLOCK_SIZE_INDICATED_FLAG,
    BLOCK_SUB_ACK, BLOCK_SUB_END, BLOCK_SUB_INIT, BLOCK_SUB_MASK, EXPEDITED_FLAG, EXPEDITED_MAX_LEN,
    LAST_SEGMENT_FLAG, SEGMENT_DATA_LEN, SIZE_INDICATED_FLAG, TOGGLE_BIT,
};
use crate::indication::{Completion, IndicationResult, ObserverId, Observers};
use crate::queue::{QueueCallback, QueuedKind, QueuedTransfer, SdoQueue};
use crate::timer::{Clock, Timer};
use crate::transport::Transport;

/// Per-request settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Step timeout, must not be zero.
    pub timeout_ms: u32,
    /// Numeric values are converted between host and wire byte order.
    pub numeric: bool,
}

impl TransferOptions {
    pub fn new(timeout_ms: u32) -> Self {
        Self { timeout_ms, numeric: false }
    }

    pub fn numeric(mut self) -> Self {
        self.numeric = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Result of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome<'a> {
    pub channel: ChannelId,
    pub address: ObjectAddress,
    pub direction: Direction,
    /// Value read, empty for writes and failed reads.
    pub data: &'a [u8],
    pub result: Result<(), AbortCode>,
}

/// Request for the next chunk of a domain write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainRefill {
    pub channel: ChannelId,
    pub address: ObjectAddress,
    /// Position of the chunk in the whole value.
    pub offset: usize,
    pub len: usize,
}

pub type DoneHook = dyn FnMut(&TransferOutcome<'_>);
/// Append the next chunk to the buffer, or answer `Pending` and hand it
/// over later through [`SdoClient::resume_domain_write`].
pub type DomainWriteHook = dyn FnMut(&DomainRefill, &mut Vec<u8>) -> IndicationResult;

struct Hooks {
    read: Observers<DoneHook>,
    write: Observers<DoneHook>,
    domain_write: Observers<DomainWriteHook>,
    next_id: u32,
}

impl Hooks {
    fn next_id(&mut self) -> ObserverId {
        self.next_id = self.next_id.wrapping_add(1);
        ObserverId(self.next_id)
    }
}

struct Ctx<'a, T> {
    transport: &'a mut T,
    hooks: &'a mut Hooks,
    config: &'a SdoConfig,
    now: u64,
}

struct ClientChannel {
    id: ChannelId,
    binding: Binding,
    state: TransferState,
    address: ObjectAddress,
    direction: Direction,
    numeric: bool,
    timeout_us: u64,
    timer: Timer,
    /// Read data, or the write data (the current chunk for domains).
    buffer: Vec<u8>,
    /// Largest value a read accepts.
    limit: usize,
    total: usize,
    size_known: bool,
    cursor: usize,
    chunk_base: usize,
    domain_chunk_len: Option<usize>,
    toggle: u8,
    expedited: bool,
    block_requested: bool,
    block_size: u8,
    seq: u8,
    window_start: usize,
    last_sent: bool,
    last_segment: Option<[u8; SEGMENT_DATA_LEN]>,
    crc_enabled: bool,
    crc: Crc,
    /// Segment held back while a domain refill is pending.
    pending_frame: Option<Frame>,
    done: Option<Box<QueueCallback>>,
}

impl ClientChannel {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            binding: Binding::UNBOUND,
            state: TransferState::Free,
            address: ObjectAddress::new(0, 0),
            direction: Direction::Read,
            numeric: false,
            timeout_us: 0,
            timer: Timer::new(),
            buffer: Vec::new(),
            limit: 0,
            total: 0,
            size_known: false,
            cursor: 0,
            chunk_base: 0,
            domain_chunk_len: None,
            toggle: 0,
            expedited: false,
            block_requested: false,
            block_size: 0,
            seq: 0,
            window_start: 0,
            last_sent: false,
            last_segment: None,
            crc_enabled: false,
            crc: Crc::new(),
            pending_frame: None,
            done: None,
        }
    }

    fn check_startable(&self, options: &TransferOptions) -> Result<(), SdoError> {
        if options.timeout_ms == 0 {
            return Err(SdoError::InvalidTimeout(options.timeout_ms));
        }
        if self.binding.tx().is_none() {
            return Err(SdoError::Disabled(self.id));
        }
        if !self.state.is_free() {
            return Err(SdoError::Busy(self.id));
        }
        Ok(())
    }

    fn begin(&mut self, address: ObjectAddress, direction: Direction, options: &TransferOptions) {
        self.address = address;
        self.direction = direction;
        self.numeric = options.numeric;
        self.timeout_us = options.timeout_ms as u64 * 1000;
        self.buffer.clear();
        self.limit = 0;
        self.total = 0;
        self.size_known = false;
        self.cursor = 0;
        self.chunk_base = 0;
        self.domain_chunk_len = None;
        self.toggle = 0;
        self.expedited = false;
        self.block_requested = false;
        self.seq = 0;
        self.window_start = 0;
        self.last_sent = false;
        self.last_segment = None;
        self.crc.reset();
        self.pending_frame = None;
    }

    /// Initiate request for a write of `self.total` bytes from the buffer.
    fn download_request(&mut self, block: bool, config: &SdoConfig) -> Frame {
        self.expedited = false;
        if block {
            let mut command = ClientCommand::BlockDownload as u8 | BLOCK_SIZE_INDICATED_FLAG;
            if config.block_crc {
                command |= BLOCK_CRC_FLAG;
            }
            self.block_requested = true;
            self.state = TransferState::BlockDownloadInit;
            let mut request = frame::with_address(command, self.address);
            frame::set_size_field(&mut request, self.total as u32);
            return request;
        }
        self.state = TransferState::DownloadInit;
        if self.total > 0 && self.total <= EXPEDITED_MAX_LEN && self.domain_chunk_len.is_none() {
            self.expedited = true;
            return frame::expedited(ClientCommand::InitiateDownload as u8, self.address, &self.buffer[..self.total]);
        }
        let mut request = frame::with_address(ClientCommand::InitiateDownload as u8 | SIZE_INDICATED_FLAG, self.address);
        frame::set_size_field(&mut request, self.total as u32);
        request
    }

    fn upload_request(&mut self, block: bool, config: &SdoConfig) -> Frame {
        if block {
            let mut command = ClientCommand::BlockUpload as u8;
            if config.block_crc {
                command |= BLOCK_CRC_FLAG;
            }
            self.block_requested = true;
            self.block_size = config.block_size;
            self.state = TransferState::BlockUploadInit;
            let mut request = frame::with_address(command, self.address);
            request[4] = config.block_size;
            return request;
        }
        self.state = TransferState::UploadInit;
        frame::with_address(ClientCommand::InitiateUpload as u8, self.address)
    }

    /// Send the first frame of a transfer. Failure leaves the channel free.
    fn open<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, request: &Frame) -> Result<(), SdoError> {
        let tx = self.binding.tx().ok_or(SdoError::Disabled(self.id))?;
        trace!("SDO client {} tx 0x{:03X} {:02X?}", self.id, tx, request);
        if let Err(e) = ctx.transport.send(tx, request) {
            self.state = TransferState::Free;
            self.timer.stop();
            return Err(e.into());
        }
        self.timer.start(ctx.now, self.timeout_us);
        debug!(
            "SDO client {}: {:?} {} started ({:?})",
            self.id, self.direction, self.address, self.state
        );
        Ok(())
    }

    fn touch(&mut self, now: u64) {
        match self.state {
            TransferState::Free | TransferState::Suspended(_) => self.timer.stop(),
            _ => self.timer.start(now, self.timeout_us),
        }
    }

    fn suspend(&mut self, point: SplitPoint) {
        self.state = TransferState::Suspended(point);
        self.timer.stop();
    }

    fn send<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, request: &Frame) -> Result<(), AbortReason> {
        let tx = self.binding.tx().ok_or(AbortReason::General)?;
        trace!("SDO client {} tx 0x{:03X} {:02X?}", self.id, tx, request);
        ctx.transport.send(tx, request).map_err(|e| {
            warn!("SDO client {}: request on 0x{:03X} not sent: {}", self.id, tx, e);
            AbortReason::OutOfMemory
        })?;
        self.touch(ctx.now);
        Ok(())
    }

    /// End the transfer and deliver its one indication.
    fn finish<T>(&mut self, ctx: &mut Ctx<'_, T>, result: Result<(), AbortCode>) {
        self.state = TransferState::Free;
        self.timer.stop();
        self.pending_frame = None;
        match result {
            Ok(()) => debug!("SDO client {}: {:?} {} done", self.id, self.direction, self.address),
            Err(code) => info!("SDO client {}: {:?} {} failed: {}", self.id, self.direction, self.address, code),
        }
        let data: &[u8] = match (self.direction, result) {
            (Direction::Read, Ok(())) => &self.buffer,
            _ => &[],
        };
        let outcome = TransferOutcome {
            channel: self.id,
            address: self.address,
            direction: self.direction,
            data,
            result,
        };
        match self.direction {
            Direction::Read => ctx.hooks.read.notify(|f| f(&outcome)),
            Direction::Write => ctx.hooks.write.notify(|f| f(&outcome)),
        }
        if let Some(done) = self.done.take() {
            done(&outcome);
        }
    }

    fn fail<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, reason: AbortReason) {
        let code = reason.code();
        warn!("SDO client {}: abort {} on {}", self.id, code, self.address);
        if let Some(tx) = self.binding.tx() {
            if let Err(e) = ctx.transport.send(tx, &frame::abort(self.address, code)) {
                warn!("SDO client {}: abort frame not sent: {}", self.id, e);
            }
        }
        self.finish(ctx, Err(code));
    }

    fn peer_abort<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, code: AbortCode) -> Result<(), AbortReason> {
        let fallback = matches!(
            self.state,
            TransferState::BlockUploadInit | TransferState::BlockDownloadInit
        );
        if fallback && self.block_requested {
            info!("SDO client {}: block mode refused ({}), retrying segmented", self.id, code);
            self.block_requested = false;
            let request = match self.direction {
                Direction::Read => self.upload_request(false, ctx.config),
                Direction::Write => self.download_request(false, ctx.config),
            };
            return self.send(ctx, &request);
        }
        self.finish(ctx, Err(code));
        Ok(())
    }

    fn check_address(&self, response: &Frame) -> Result<(), AbortReason> {
        let address = ObjectAddress::decode(response);
        if address != self.address {
            warn!("SDO client {}: response for {} while waiting for {}", self.id, address, self.address);
            return Err(AbortReason::InvalidValue);
        }
        Ok(())
    }

    fn on_frame<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, response: &Frame) -> Result<(), AbortReason> {
        if frame::is_abort(response) {
            return self.peer_abort(ctx, frame::abort_code(response));
        }
        if self.state == TransferState::BlockUploadBlock {
            return self.receive_block_segment(ctx, response);
        }
        let command = response[0];
        match ServerCommand::parse(command) {
            Some(ServerCommand::InitiateUpload) => self.upload_init_response(ctx, response),
            Some(ServerCommand::UploadSegment) => self.upload_segment(ctx, response),
            Some(ServerCommand::InitiateDownload) => self.download_init_response(ctx, response),
            Some(ServerCommand::DownloadSegment) => self.download_segment_response(ctx, response),
            Some(ServerCommand::BlockUpload) => match command & BLOCK_SUB_END {
                0 => self.block_upload_init_response(ctx, response),
                _ => self.block_upload_end(ctx, response),
            },
            Some(ServerCommand::BlockDownload) => match command & BLOCK_SUB_MASK {
                BLOCK_SUB_INIT => self.block_download_init_response(ctx, response),
                BLOCK_SUB_ACK => self.block_download_ack(ctx, response),
                BLOCK_SUB_END => self.block_download_end(ctx),
                _ => Err(AbortReason::UnknownCommand),
            },
            Some(ServerCommand::Abort) | None => Err(AbortReason::UnknownCommand),
        }
    }

    fn complete_read<T>(&mut self, ctx: &mut Ctx<'_, T>) {
        frame::swap_numeric(&mut self.buffer, self.numeric);
        self.finish(ctx, Ok(()));
    }

    fn upload_init_response<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, response: &Frame) -> Result<(), AbortReason> {
        // a server may answer a block request with a plain upload
        if !matches!(self.state, TransferState::UploadInit | TransferState::BlockUploadInit) {
            return Err(AbortReason::UnknownCommand);
        }
        self.check_address(response)?;
        let command = response[0];
        if command & EXPEDITED_FLAG != 0 {
            let len = frame::expedited_len(command);
            if len > self.limit {
                return Err(AbortReason::DataTypeMismatch);
            }
            self.buffer.extend_from_slice(&response[4..4 + len]);
            self.cursor = len;
            self.complete_read(ctx);
            return Ok(());
        }
        if command & SIZE_INDICATED_FLAG != 0 {
            let size = frame::size_field(response) as usize;
            if size > self.limit {
                return Err(AbortReason::DataTypeMismatch);
            }
            self.total = size;
            self.size_known = true;
        }
        self.toggle = 0;
        self.state = TransferState::UploadSegment;
        self.send(ctx, &[ClientCommand::UploadSegment as u8, 0, 0, 0, 0, 0, 0, 0])
    }

    fn upload_segment<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, response: &Frame) -> Result<(), AbortReason> {
        if self.state != TransferState::UploadSegment {
            return Err(AbortReason::UnknownCommand);
        }
        let command = response[0];
        if command & TOGGLE_BIT != self.toggle {
            return Err(AbortReason::ToggleMismatch);
        }
        let len = frame::segment_len(command);
        if self.cursor + len > self.total {
            return Err(AbortReason::DataTypeMismatch);
        }
        self.buffer.extend_from_slice(&response[1..1 + len]);
        self.cursor += len;

        if command & LAST_SEGMENT_FLAG != 0 {
            if self.size_known && self.cursor != self.total {
                return Err(AbortReason::DataTypeMismatch);
            }
            self.complete_read(ctx);
            return Ok(());
        }
        self.toggle ^= TOGGLE_BIT;
        self.send(ctx, &[ClientCommand::UploadSegment as u8 | self.toggle, 0, 0, 0, 0, 0, 0, 0])
    }

    fn download_init_response<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, response: &Frame) -> Result<(), AbortReason> {
        if self.state != TransferState::DownloadInit {
            return Err(AbortReason::UnknownCommand);
        }
        self.check_address(response)?;
        if self.expedited {
            self.cursor = self.total;
            self.finish(ctx, Ok(()));
            return Ok(());
        }
        self.toggle = 0;
        self.send_next_segment(ctx)
    }

    fn send_next_segment<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>) -> Result<(), AbortReason> {
        let len = SEGMENT_DATA_LEN.min(self.total - self.cursor);
        let at = self.cursor - self.chunk_base;
        let data = self.buffer.get(at..at + len).ok_or(AbortReason::NoData)?;
        let last = self.cursor + len == self.total;
        let request = frame::segment(ClientCommand::DownloadSegment as u8, self.toggle, data, last);
        self.cursor += len;
        self.last_sent = last;
        self.state = TransferState::DownloadSegment;

        if let Some(chunk_len) = self.domain_chunk_len {
            if !last && self.cursor - self.chunk_base >= chunk_len {
                if self.refill(ctx, chunk_len)? == Completion::Pending {
                    self.pending_frame = Some(request);
                    self.suspend(SplitPoint::DomainWrite);
                    return Ok(());
                }
                self.check_refill()?;
            }
        }
        self.send(ctx, &request)
    }

    /// Ask the domain observers for the chunk starting at the cursor.
    fn refill<T>(&mut self, ctx: &mut Ctx<'_, T>, chunk_len: usize) -> IndicationResult {
        self.chunk_base = self.cursor;
        self.buffer.clear();
        let refill = DomainRefill {
            channel: self.id,
            address: self.address,
            offset: self.cursor,
            len: chunk_len.min(self.total - self.cursor),
        };
        trace!("SDO client {}: domain chunk at {} ({} bytes)", self.id, refill.offset, refill.len);
        let buffer = &mut self.buffer;
        ctx.hooks.domain_write.consult(|f| f(&refill, &mut *buffer))
    }

    fn check_refill(&self) -> Result<(), AbortReason> {
        let chunk_len = self.domain_chunk_len.unwrap_or(SEGMENT_DATA_LEN);
        let needed = chunk_len.min(self.total - self.cursor);
        if self.buffer.len() < needed {
            warn!(
                "SDO client {}: domain chunk of {} bytes, {} needed",
                self.id,
                self.buffer.len(),
                needed
            );
            return Err(AbortReason::NoData);
        }
        Ok(())
    }

    fn resume_domain_write<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, chunk: &[u8]) -> Result<(), AbortReason> {
        self.buffer.extend_from_slice(chunk);
        self.check_refill()?;
        let request = self.pending_frame.take().ok_or(AbortReason::General)?;
        self.state = TransferState::DownloadSegment;
        self.send(ctx, &request)
    }

    fn download_segment_response<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, response: &Frame) -> Result<(), AbortReason> {
        if self.state != TransferState::DownloadSegment {
            return Err(AbortReason::UnknownCommand);
        }
        if response[0] & TOGGLE_BIT != self.toggle {
            return Err(AbortReason::ToggleMismatch);
        }
        self.toggle ^= TOGGLE_BIT;
        if self.last_sent {
            self.finish(ctx, Ok(()));
            return Ok(());
        }
        self.send_next_segment(ctx)
    }
}

/// SDO client with a fixed set of channels and a request queue.
pub struct SdoClient<T, C> {
    config: SdoConfig,
    channels: ChannelPool<ClientChannel>,
    hooks: Hooks,
    queue: SdoQueue,
    transport: T,
    clock: C,
}

impl<T: Transport, C: Clock> SdoClient<T, C> {
    /// All channels start unbound, see [`SdoClient::bind_server`].
    pub fn new(config: SdoConfig, transport: T, clock: C) -> Result<Self, SdoError> {
        config.validate()?;
        let channels = ChannelPool::new(config.client_channels, ClientChannel::new);
        let queue = SdoQueue::new(config.queue_capacity);
        info!("SDO client with {} channel(s)", channels.len());
        Ok(Self {
            config,
            channels,
            hooks: Hooks {
                read: Observers::new(),
                write: Observers::new(),
                domain_write: Observers::new(),
                next_id: 0,
            },
            queue,
            transport,
            clock,
        })
    }

    /// Options with the configured default timeout.
    pub fn default_options(&self) -> TransferOptions {
        TransferOptions::new(self.config.default_timeout_ms)
    }

    /// Bind a channel to the predefined connection of `node_id`.
    pub fn bind_server(&mut self, id: ChannelId, node_id: u8) -> Result<(), SdoError> {
        if node_id == 0 || node_id > 127 {
            return Err(SdoError::Config(format!("node id {} outside 1..=127", node_id)));
        }
        self.set_cob_ids(id, CobIds::client(node_id))
    }

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

    /// Read up to `max_len` bytes, in block mode if `max_len` reaches the
    /// block threshold.
    pub fn read(&mut self, id: ChannelId, address: ObjectAddress, max_len: usize, options: TransferOptions) -> Result<(), SdoError> {
        self.start_read(id, address, max_len, options, true)
    }

    /// Read without block mode.
    pub fn read_segmented(
        &mut self,
        id: ChannelId,
        address: ObjectAddress,
        max_len: usize,
        options: TransferOptions,
    ) -> Result<(), SdoError> {
        self.start_read(id, address, max_len, options, false)
    }

    pub fn write(&mut self, id: ChannelId, address: ObjectAddress, data: &[u8], options: TransferOptions) -> Result<(), SdoError> {
        self.start_write(id, address, data, options, true)
    }

    /// Write without block mode.
    pub fn write_segmented(
        &mut self,
        id: ChannelId,
        address: ObjectAddress,
        data: &[u8],
        options: TransferOptions,
    ) -> Result<(), SdoError> {
        self.start_write(id, address, data, options, false)
    }

    /// Segmented write of a `total_len` byte domain from chunks of
    /// `segments_per_chunk` segments. `first_chunk` must hold the first
    /// chunk, later chunks come from the domain write observers.
    pub fn write_domain(
        &mut self,
        id: ChannelId,
        address: ObjectAddress,
        total_len: usize,
        first_chunk: &[u8],
        segments_per_chunk: u16,
        options: TransferOptions,
    ) -> Result<(), SdoError> {
        if segments_per_chunk == 0 {
            return Err(SdoError::Config("domain chunk needs at least one segment".to_string()));
        }
        let chunk_len = segments_per_chunk as usize * SEGMENT_DATA_LEN;
        let needed = chunk_len.min(total_len);
        if first_chunk.len() < needed {
            return Err(SdoError::BufferTooShort {
                len: first_chunk.len(),
                declared: needed,
            });
        }
        let now = self.clock.now_us();
        let channel = self.channels.get_mut(id)?;
        channel.check_startable(&options)?;
        channel.begin(address, Direction::Write, &options);
        channel.buffer.extend_from_slice(&first_chunk[..needed]);
        channel.total = total_len;
        channel.domain_chunk_len = Some(chunk_len);
        let request = channel.download_request(false, &self.config);
        let mut ctx = Ctx {
            transport: &mut self.transport,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        channel.open(&mut ctx, &request)
    }

    fn start_read(
        &mut self,
        id: ChannelId,
        address: ObjectAddress,
        max_len: usize,
        options: TransferOptions,
        allow_block: bool,
    ) -> Result<(), SdoError> {
        if max_len == 0 {
            return Err(SdoError::BufferTooShort { len: 0, declared: 1 });
        }
        let block = allow_block && max_len >= self.config.block_threshold;
        let now = self.clock.now_us();
        let channel = self.channels.get_mut(id)?;
        channel.check_startable(&options)?;
        channel.begin(address, Direction::Read, &options);
        channel.limit = max_len;
        channel.total = max_len;
        let request = channel.upload_request(block, &self.config);
        let mut ctx = Ctx {
            transport: &mut self.transport,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        channel.open(&mut ctx, &request)
    }

    fn start_write(
        &mut self,
        id: ChannelId,
        address: ObjectAddress,
        data: &[u8],
        options: TransferOptions,
        allow_block: bool,
    ) -> Result<(), SdoError> {
        let block = allow_block && data.len() >= self.config.block_threshold;
        let now = self.clock.now_us();
        let channel = self.channels.get_mut(id)?;
        channel.check_startable(&options)?;
        channel.begin(address, Direction::Write, &options);
        channel.buffer.extend_from_slice(data);
        frame::swap_numeric(&mut channel.buffer, options.numeric);
        channel.total = data.len();
        let request = channel.download_request(block, &self.config);
        let mut ctx = Ctx {
            transport: &mut self.transport,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        channel.open(&mut ctx, &request)
    }

    /// Hand over the chunk a domain write observer deferred, or abort the
    /// transfer with the given reason.
    pub fn resume_domain_write(&mut self, id: ChannelId, chunk: Result<&[u8], AbortReason>) -> Result<(), SdoError> {
        let now = self.clock.now_us();
        let channel = self.channels.get_mut(id)?;
        if channel.state != TransferState::Suspended(SplitPoint::DomainWrite) {
            return Err(SdoError::NotSuspended(id));
        }
        let mut ctx = Ctx {
            transport: &mut self.transport,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        if let Err(reason) = chunk.and_then(|chunk| channel.resume_domain_write(&mut ctx, chunk)) {
            channel.fail(&mut ctx, reason);
        }
        self.start_queued();
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
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        channel.fail(&mut ctx, reason);
        self.start_queued();
        Ok(())
    }

    /// Process a received frame. Returns false if no channel listens on
    /// `cob_id`.
    pub fn handle_frame(&mut self, cob_id: u16, response: &Frame) -> bool {
        let Some(id) = self.channels.find(|c| c.binding.accepts(cob_id)) else {
            return false;
        };
        trace!("SDO client {} rx 0x{:03X} {:02X?}", id, cob_id, response);
        let now = self.clock.now_us();
        let Ok(channel) = self.channels.get_mut(id) else {
            return false;
        };
        if channel.state.is_free() {
            debug!("SDO client {}: frame without transfer dropped", id);
            return true;
        }
        let mut ctx = Ctx {
            transport: &mut self.transport,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        match channel.on_frame(&mut ctx, response) {
            Ok(()) => channel.touch(now),
            Err(reason) => channel.fail(&mut ctx, reason),
        }
        self.start_queued();
        true
    }

    /// Check timeouts, stream block download windows and start queued
    /// requests.
    pub fn poll(&mut self) {
        let now = self.clock.now_us();
        let mut ctx = Ctx {
            transport: &mut self.transport,
            hooks: &mut self.hooks,
            config: &self.config,
            now,
        };
        for channel in self.channels.iter_mut() {
            if channel.timer.poll(now) {
                warn!("SDO client {}: no answer for {} in time", channel.id, channel.address);
                channel.fail(&mut ctx, AbortReason::Timeout);
                continue;
            }
            if channel.state == TransferState::BlockDownloadBlock {
                if let Err(reason) = channel.stream_block(&mut ctx) {
                    channel.fail(&mut ctx, reason);
                }
            }
        }
        self.start_queued();
    }

    /// Queue a read. It starts once the channel is free and earlier queued
    /// requests for it are done; `done` gets its outcome.
    pub fn queue_read(
        &mut self,
        id: ChannelId,
        address: ObjectAddress,
        max_len: usize,
        options: TransferOptions,
        done: impl FnOnce(&TransferOutcome<'_>) + 'static,
    ) -> Result<(), SdoError> {
        self.enqueue(QueuedTransfer {
            channel: id,
            address,
            kind: QueuedKind::Read { max_len },
            options,
            done: Box::new(done),
        })
    }

    pub fn queue_write(
        &mut self,
        id: ChannelId,
        address: ObjectAddress,
        data: &[u8],
        options: TransferOptions,
        done: impl FnOnce(&TransferOutcome<'_>) + 'static,
    ) -> Result<(), SdoError> {
        self.enqueue(QueuedTransfer {
            channel: id,
            address,
            kind: QueuedKind::Write { data: data.to_vec() },
            options,
            done: Box::new(done),
        })
    }

    fn enqueue(&mut self, entry: QueuedTransfer) -> Result<(), SdoError> {
        self.channels.get(entry.channel)?;
        if entry.options.timeout_ms == 0 {
            return Err(SdoError::InvalidTimeout(0));
        }
        self.queue.push(entry)?;
        self.start_queued();
        Ok(())
    }

    fn start_queued(&mut self) {
        for index in 0..self.channels.len() {
            let id = ChannelId(index as u8);
            while self.channels.get(id).is_ok_and(|c| c.state.is_free()) {
                let Some(entry) = self.queue.take_for(id) else {
                    break;
                };
                let started = match &entry.kind {
                    QueuedKind::Read { max_len } => self.read(id, entry.address, *max_len, entry.options),
                    QueuedKind::Write { data } => self.write(id, entry.address, data, entry.options),
                };
                match started {
                    Ok(()) => {
                        if let Ok(channel) = self.channels.get_mut(id) {
                            channel.done = Some(entry.done);
                        }
                    }
                    Err(e) => {
                        warn!("SDO client {}: queued transfer of {} not started: {}", id, entry.address, e);
                        let direction = match entry.kind {
                            QueuedKind::Read { .. } => Direction::Read,
                            QueuedKind::Write { .. } => Direction::Write,
                        };
                        (entry.done)(&TransferOutcome {
                            channel: id,
                            address: entry.address,
                            direction,
                            data: &[],
                            result: Err(AbortCode::GENERAL),
                        });
                    }
                }
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn state(&self, id: ChannelId) -> Result<TransferState, SdoError> {
        self.channels.get(id).map(|c| c.state)
    }

    pub fn on_read(&mut self, hook: impl FnMut(&TransferOutcome<'_>) + 'static) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.read.register(id, Box::new(hook));
        id
    }

    pub fn on_write(&mut self, hook: impl FnMut(&TransferOutcome<'_>) + 'static) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.write.register(id, Box::new(hook));
        id
    }

    /// Every observer is asked for each chunk and may append to the buffer.
    /// If any of them answers `Pending` the write waits for
    /// [`SdoClient::resume_domain_write`].
    pub fn on_domain_write(
        &mut self,
        hook: impl FnMut(&DomainRefill, &mut Vec<u8>) -> IndicationResult + 'static,
    ) -> ObserverId {
        let id = self.hooks.next_id();
        self.hooks.domain_write.register(id, Box::new(hook));
        id
    }

    /// Unregister an observer. Returns false if `id` is not registered.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.hooks.read.remove(id) || self.hooks.write.remove(id) || self.hooks.domain_write.remove(id)
    }

    pub fn config(&self) -> &SdoConfig {
        &self.config
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
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::timer::ManualClock;
    use crate::transport::FrameQueue;

    const SERVER: u8 = 4;
    const TX: u16 = 0x604;
    const RX: u16 = 0x584;
    const DEVICE_TYPE: ObjectAddress = ObjectAddress::new(0x1000, 0);

    type Client = SdoClient<FrameQueue, ManualClock>;

    fn client() -> (Client, Rc<RefCell<Vec<(Vec<u8>, Result<(), AbortCode>)>>>) {
        let mut client = SdoClient::new(SdoConfig::default(), FrameQueue::new(64), ManualClock::new()).unwrap();
        client.bind_server(ChannelId(0), SERVER).unwrap();
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        client.on_read(move |outcome| sink.borrow_mut().push((outcome.data.to_vec(), outcome.result)));
        let sink = results.clone();
        client.on_write(move |outcome| sink.borrow_mut().push((Vec::new(), outcome.result)));
        (client, results)
    }

    fn sent(client: &mut Client) -> Frame {
        let (cob, request) = client.transport_mut().pop().expect("nothing sent");
        assert_eq!(cob, TX);
        request
    }

    #[test]
    fn expedited_read() {
        let (mut client, results) = client();
        let options = client.default_options();
        client.read(ChannelId(0), DEVICE_TYPE, 4, options).unwrap();
        assert_eq!(sent(&mut client), [0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
        assert!(client.handle_frame(RX, &[0x43, 0x00, 0x10, 0x00, 0x92, 0x01, 0x02, 0x00]));
        assert_eq!(*results.borrow(), vec![(vec![0x92, 0x01, 0x02, 0x00], Ok(()))]);
        assert!(client.state(ChannelId(0)).unwrap().is_free());
    }

    #[test]
    fn request_validation() {
        let (mut client, _) = client();
        let options = client.default_options();
        assert!(matches!(
            client.read(ChannelId(0), DEVICE_TYPE, 4, TransferOptions::new(0)),
            Err(SdoError::InvalidTimeout(0))
        ));
        assert!(matches!(
            client.read(ChannelId(1), DEVICE_TYPE, 4, options),
            Err(SdoError::InvalidChannel(_))
        ));
        client.read(ChannelId(0), DEVICE_TYPE, 4, options).unwrap();
        assert!(matches!(client.read(ChannelId(0), DEVICE_TYPE, 4, options), Err(SdoError::Busy(_))));
        assert!(matches!(client.set_cob_ids(ChannelId(0), CobIds::client(5)), Err(SdoError::Busy(_))));
    }

    #[test]
    fn unbound_channel_is_disabled() {
        let mut client: Client = SdoClient::new(SdoConfig::default(), FrameQueue::new(4), ManualClock::new()).unwrap();
        let options = client.default_options();
        assert!(matches!(client.read(ChannelId(0), DEVICE_TYPE, 4, options), Err(SdoError::Disabled(_))));
    }

    #[test]
    fn wrong_multiplexer_aborts() {
        let (mut client, results) = client();
        let options = client.default_options();
        client.read(ChannelId(0), DEVICE_TYPE, 4, options).unwrap();
        sent(&mut client);
        client.handle_frame(RX, &[0x43, 0x01, 0x10, 0x00, 1, 2, 3, 4]);
        let abort = sent(&mut client);
        assert_eq!(frame::abort_code(&abort), AbortReason::InvalidValue.code());
        assert_eq!(results.borrow()[0].1, Err(AbortReason::InvalidValue.code()));
    }

    #[test]
    fn oversized_value_is_refused() {
        let (mut client, results) = client();
        let options = client.default_options();
        client.read(ChannelId(0), DEVICE_TYPE, 2, options).unwrap();
        sent(&mut client);
        client.handle_frame(RX, &[0x43, 0x00, 0x10, 0x00, 1, 2, 3, 4]);
        assert_eq!(frame::abort_code(&sent(&mut client)), AbortReason::DataTypeMismatch.code());
        assert_eq!(results.borrow().len(), 1);
    }

    #[test]
    fn server_abort_reports_code() {
        let (mut client, results) = client();
        let options = client.default_options();
        client.write(ChannelId(0), DEVICE_TYPE, &[1, 2], options).unwrap();
        assert_eq!(sent(&mut client), [0x2B, 0x00, 0x10, 0x00, 1, 2, 0, 0]);
        client.handle_frame(RX, &frame::abort(DEVICE_TYPE, AbortReason::NoWritePermission.code()));
        assert!(client.transport().is_empty());
        assert_eq!(results.borrow()[0].1, Err(AbortReason::NoWritePermission.code()));
    }

    #[test]
    fn timeout_aborts_once() {
        let clock = ManualClock::new();
        let mut client = SdoClient::new(SdoConfig::default(), FrameQueue::new(8), clock.clone()).unwrap();
        client.bind_server(ChannelId(0), SERVER).unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        client.on_read(move |outcome| sink.borrow_mut().push(outcome.result));
        client.read(ChannelId(0), DEVICE_TYPE, 4, TransferOptions::new(50)).unwrap();
        sent(&mut client);
        clock.advance_ms(50);
        client.poll();
        client.poll();
        assert_eq!(*calls.borrow(), vec![Err(AbortReason::Timeout.code())]);
        assert_eq!(frame::abort_code(&sent(&mut client)), AbortReason::Timeout.code());
    }

    #[test]
    fn abort_api() {
        let (mut client, results) = client();
        assert!(matches!(client.abort(ChannelId(0), AbortReason::General), Err(SdoError::NotActive(_))));
        let options = client.default_options();
        client.read(ChannelId(0), DEVICE_TYPE, 4, options).unwrap();
        sent(&mut client);
        client.abort(ChannelId(0), AbortReason::LocalControl).unwrap();
        assert_eq!(frame::abort_code(&sent(&mut client)), AbortReason::LocalControl.code());
        assert_eq!(results.borrow()[0].1, Err(AbortReason::LocalControl.code()));
    }

    #[test]
    fn removed_read_observer_is_not_told() {
        let (mut client, results) = client();
        let calls = Rc::new(RefCell::new(0));
        let sink = calls.clone();
        let id = client.on_read(move |_| *sink.borrow_mut() += 1);
        assert!(client.remove_observer(id));
        let options = client.default_options();
        client.read(ChannelId(0), DEVICE_TYPE, 4, options).unwrap();
        sent(&mut client);
        client.handle_frame(RX, &[0x43, 0x00, 0x10, 0x00, 1, 2, 3, 4]);
        assert_eq!(*calls.borrow(), 0);
        assert_eq!(results.borrow().len(), 1);
    }

    #[test]
    fn full_transmit_buffer_rejects_request() {
        let mut client: Client = SdoClient::new(SdoConfig::default(), FrameQueue::new(1), ManualClock::new()).unwrap();
        client.bind_server(ChannelId(0), SERVER).unwrap();
        client.transport_mut().send(0x700, &[0; 8]).unwrap();
        let options = client.default_options();
        assert!(matches!(client.read(ChannelId(0), DEVICE_TYPE, 4, options), Err(SdoError::Transmit(_))));
        assert!(client.state(ChannelId(0)).unwrap().is_free());
    }
}
