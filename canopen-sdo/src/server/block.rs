//! Block upload and block download on the server side.

use log::{debug, trace, warn};

use super::{Ctx, ServerChannel, WriteMode, WriteStage};
use crate::abort::AbortReason;
use crate::channel::{SplitPoint, TransferState};
use crate::frame::{
    self, Frame, ServerCommand, BLOCK_CRC_FLAG, BLOCK_LAST_FLAG, BLOCK_SEQ_MASK,
    BLOCK_SIZE_INDICATED_FLAG, BLOCK_SUB_END, MAX_BLOCK_SIZE, SEGMENT_DATA_LEN,
};
use crate::indication::Completion;
use crate::store::ObjectStore;
use crate::transport::{TransmitError, Transport};

impl ServerChannel {
    pub(super) fn block_upload_init<T: Transport, S: ObjectStore>(
        &mut self,
        ctx: &mut Ctx<'_, T, S>,
        frame: &Frame,
    ) -> Result<(), AbortReason> {
        self.open(&*ctx.store, frame, false)?;
        let block_size = frame[4];
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(AbortReason::WrongBlockSize);
        }
        self.block_size = block_size;
        self.crc_enabled = frame[0] & BLOCK_CRC_FLAG != 0 && ctx.config.block_crc;
        self.state = TransferState::BlockUploadInit;

        let request = self.request();
        if ctx.indicate_read(&request)? == Completion::Pending {
            self.suspend(SplitPoint::BlockUploadInit);
            return Ok(());
        }
        self.respond_block_upload_init(ctx)
    }

    pub(super) fn respond_block_upload_init<T: Transport, S>(&mut self, ctx: &mut Ctx<'_, T, S>) -> Result<(), AbortReason> {
        let mut command = ServerCommand::BlockUpload as u8 | BLOCK_SIZE_INDICATED_FLAG;
        if self.crc_enabled {
            command |= BLOCK_CRC_FLAG;
        }
        let mut response = frame::with_address(command, self.address);
        frame::set_size_field(&mut response, self.total as u32);
        self.state = TransferState::BlockUploadInit;
        self.send(ctx, &response)
    }

    pub(super) fn block_upload_start(&mut self) -> Result<(), AbortReason> {
        if self.state != TransferState::BlockUploadInit {
            return Err(AbortReason::UnknownCommand);
        }
        self.cursor = 0;
        self.window_start = 0;
        self.seq = 0;
        self.last_sent = false;
        self.chunk_ready = false;
        self.crc.reset();
        self.state = TransferState::BlockUploadBlock;
        Ok(())
    }

    /// Send as much of the current window as the transmit buffer takes.
    pub(super) fn stream_block<T: Transport, S: ObjectStore>(&mut self, ctx: &mut Ctx<'_, T, S>) -> Result<(), AbortReason> {
        let span = self.block_size as usize * SEGMENT_DATA_LEN;
        if self.refill_chunk(ctx, span)? == Completion::Pending {
            self.suspend(SplitPoint::BlockUploadWindow);
            return Ok(());
        }
        let tx = self.binding.tx().ok_or(AbortReason::General)?;

        while self.state == TransferState::BlockUploadBlock {
            if ctx.transport.fill_percent() > ctx.config.tx_pressure_percent {
                trace!("SDO server {}: transmit buffer busy, window paused", self.id);
                return Ok(());
            }
            let len = SEGMENT_DATA_LEN.min(self.total - self.cursor);
            let mut data = [0u8; SEGMENT_DATA_LEN];
            self.read_object(ctx.store, self.cursor, &mut data[..len])?;
            let last = self.cursor + len == self.total;
            let segment = frame::block_segment(self.seq + 1, last, &data[..len]);
            match ctx.transport.send(tx, &segment) {
                Ok(()) => {}
                Err(TransmitError::BufferFull) => return Ok(()),
                Err(e) => {
                    warn!("SDO server {}: block segment not sent: {}", self.id, e);
                    return Err(AbortReason::OutOfMemory);
                }
            }
            self.crc.feed(self.cursor, &data[..len]);
            self.cursor += len;
            self.seq += 1;
            if last || self.seq >= self.block_size {
                self.last_sent = last;
                self.state = TransferState::BlockUploadAck;
            }
            self.touch(ctx);
        }
        Ok(())
    }

    pub(super) fn block_upload_ack<T: Transport, S>(&mut self, ctx: &mut Ctx<'_, T, S>, frame: &Frame) -> Result<(), AbortReason> {
        match self.state {
            TransferState::BlockUploadAck => {}
            TransferState::BlockUploadBlock | TransferState::BlockUploadEnd => {
                debug!("SDO server {}: acknowledge ignored in {:?}", self.id, self.state);
                return Ok(());
            }
            _ => return Err(AbortReason::UnknownCommand),
        }
        let ack = frame[1];
        let next_size = frame[2];
        if ack > MAX_BLOCK_SIZE || ack > self.seq {
            return Err(AbortReason::WrongSequenceNumber);
        }
        if ack == self.seq && self.last_sent {
            let crc = self.crc_enabled.then(|| self.crc.value());
            let unused = frame::unused_in_last_segment(self.total);
            let end = frame::block_end(ServerCommand::BlockUpload as u8, unused, crc);
            self.state = TransferState::BlockUploadEnd;
            return self.send(ctx, &end);
        }
        if next_size == 0 || next_size > MAX_BLOCK_SIZE {
            return Err(AbortReason::WrongBlockSize);
        }
        if ack < self.seq {
            debug!("SDO server {}: client took {} of {} segments", self.id, ack, self.seq);
        }
        // ack 0 repeats the whole window
        let acked = (self.window_start + ack as usize * SEGMENT_DATA_LEN).min(self.total);
        self.cursor = acked;
        self.window_start = acked;
        self.block_size = next_size;
        self.seq = 0;
        self.last_sent = false;
        self.chunk_ready = false;
        self.state = TransferState::BlockUploadBlock;
        Ok(())
    }

    pub(super) fn block_upload_end(&mut self) -> Result<(), AbortReason> {
        if self.state != TransferState::BlockUploadEnd {
            return Err(AbortReason::UnknownCommand);
        }
        debug!("SDO server {}: block read of {} done ({} bytes)", self.id, self.address, self.total);
        self.release();
        Ok(())
    }

    pub(super) fn block_download_init<T: Transport, S: ObjectStore>(
        &mut self,
        ctx: &mut Ctx<'_, T, S>,
        frame: &Frame,
    ) -> Result<(), AbortReason> {
        self.open(&*ctx.store, frame, true)?;
        let command = frame[0];
        self.size_indicated = command & BLOCK_SIZE_INDICATED_FLAG != 0;
        let len = if self.size_indicated {
            frame::size_field(frame) as usize
        } else {
            self.info.max_size
        };
        if self.size_indicated {
            self.check_declared(len)?;
        }
        let request = self.request();
        ctx.check_write(&request, len, None)?;

        self.total = len;
        self.mode = WriteMode::Block;
        self.crc_enabled = command & BLOCK_CRC_FLAG != 0 && ctx.config.block_crc;
        self.block_size = ctx.config.block_size;
        let mut response_command = ServerCommand::BlockDownload as u8;
        if self.crc_enabled {
            response_command |= BLOCK_CRC_FLAG;
        }
        let mut response = frame::with_address(response_command, self.address);
        response[4] = self.block_size;
        self.state = TransferState::BlockDownloadBlock;
        self.send(ctx, &response)
    }

    /// Sub-block segment. Only the next sequence number is taken, anything
    /// else is dropped and shows up in the acknowledge.
    pub(super) fn receive_block_segment<T: Transport, S: ObjectStore>(
        &mut self,
        ctx: &mut Ctx<'_, T, S>,
        frame: &Frame,
    ) -> Result<(), AbortReason> {
        let seq = frame[0] & BLOCK_SEQ_MASK;
        let last = frame[0] & BLOCK_LAST_FLAG != 0;
        if seq == self.seq + 1 {
            self.seq = seq;
            if last {
                let mut tail = [0u8; SEGMENT_DATA_LEN];
                tail.copy_from_slice(&frame[1..]);
                self.last_segment = Some(tail);
            } else {
                let offset = self.cursor;
                self.accept_data(ctx.store, &frame[1..])?;
                self.crc.feed(offset, &frame[1..]);
            }
        } else {
            trace!("SDO server {}: segment {} dropped, expected {}", self.id, seq, self.seq + 1);
        }

        if last || seq >= self.block_size {
            if self.info.domain
                && self.cursor > self.chunk_base
                && self.drain_chunk(ctx, false)? == Completion::Pending
            {
                self.suspend(SplitPoint::BlockDownloadAck);
                return Ok(());
            }
            return self.send_block_ack(ctx);
        }
        Ok(())
    }

    pub(super) fn send_block_ack<T: Transport, S>(&mut self, ctx: &mut Ctx<'_, T, S>) -> Result<(), AbortReason> {
        let ack = frame::block_ack(ServerCommand::BlockDownload as u8, self.seq, self.block_size);
        self.seq = 0;
        self.state = if self.last_segment.is_some() {
            TransferState::BlockDownloadEnd
        } else {
            TransferState::BlockDownloadBlock
        };
        self.send(ctx, &ack)
    }

    pub(super) fn block_download_end<T: Transport, S: ObjectStore>(
        &mut self,
        ctx: &mut Ctx<'_, T, S>,
        frame: &Frame,
    ) -> Result<(), AbortReason> {
        if self.state != TransferState::BlockDownloadEnd {
            return Err(AbortReason::UnknownCommand);
        }
        let tail = self.last_segment.take().ok_or(AbortReason::UnknownCommand)?;
        let len = SEGMENT_DATA_LEN - frame::block_end_unused(frame[0]);
        let offset = self.cursor;
        self.accept_data(ctx.store, &tail[..len])?;
        self.crc.feed(offset, &tail[..len]);

        if self.size_indicated && self.cursor != self.total {
            return Err(AbortReason::DataTypeMismatch);
        }
        self.check_declared(self.cursor)?;
        self.total = self.cursor;
        if self.crc_enabled && self.crc.value() != frame::block_end_crc(frame) {
            warn!(
                "SDO server {}: CRC 0x{:04X} received, 0x{:04X} computed",
                self.id,
                frame::block_end_crc(frame),
                self.crc.value()
            );
            return Err(AbortReason::CrcError);
        }
        self.stage = Some(WriteStage::Drain);
        self.complete_write(ctx)
    }
}

#[cfg(test)]
mod tests {
    use crate::abort::AbortReason;
    use crate::channel::{ChannelId, TransferState};
    use crate::config::SdoConfig;
    use crate::crc;
    use crate::frame::{self, Frame, ObjectAddress};
    use crate::server::SdoServer;
    use crate::store::{Access, MemoryStore};
    use crate::timer::ManualClock;
    use crate::transport::FrameQueue;

    const RX: u16 = 0x605;
    const BLOB: ObjectAddress = ObjectAddress::new(0x2100, 0);

    type Server = SdoServer<FrameQueue, MemoryStore, ManualClock>;

    fn server(blob: &[u8]) -> Server {
        let mut store = MemoryStore::new();
        store.insert(BLOB, blob, 512, Access::READ_WRITE);
        let config = SdoConfig { block_size: 4, ..Default::default() };
        SdoServer::new(config, 5, FrameQueue::new(256), store, ManualClock::new()).unwrap()
    }

    fn drain(server: &mut Server) -> Vec<Frame> {
        server.transport_mut().drain().map(|(_, f)| f).collect()
    }

    #[test]
    fn upload_rewinds_to_first_missing_segment() {
        let blob: Vec<u8> = (0..40u8).collect();
        let mut server = server(&blob);
        server.handle_frame(RX, &[0xA4, 0x00, 0x21, 0x00, 4, 0, 0, 0]);
        assert_eq!(drain(&mut server), vec![[0xC6, 0x00, 0x21, 0x00, 40, 0, 0, 0]]);
        server.handle_frame(RX, &[0xA3, 0, 0, 0, 0, 0, 0, 0]);
        server.poll();
        let window = drain(&mut server);
        assert_eq!(window.len(), 4);
        assert_eq!(window[3][0], 4);

        // segment 3 lost
        server.handle_frame(RX, &[0xA2, 2, 4, 0, 0, 0, 0, 0]);
        server.poll();
        let window = drain(&mut server);
        assert_eq!(window.len(), 4);
        assert_eq!(window[0][0], 1);
        assert_eq!(&window[0][1..], &blob[14..21]);
        // 40 bytes: 14 + 4 * 7 = 42, the fourth segment is last
        assert_eq!(window[3][0], 0x84);

        server.handle_frame(RX, &[0xA2, 4, 4, 0, 0, 0, 0, 0]);
        let end = drain(&mut server);
        assert_eq!(end.len(), 1);
        assert_eq!(end[0][0], 0xC1 | (2 << 2));
        assert_eq!(frame::block_end_crc(&end[0]), crc::checksum(&blob));
        server.handle_frame(RX, &[0xA1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(server.state(ChannelId(0)).unwrap().is_free());
    }

    #[test]
    fn ack_during_streaming_is_ignored() {
        let mut server = server(&[0u8; 100]);
        server.handle_frame(RX, &[0xA4, 0x00, 0x21, 0x00, 4, 0, 0, 0]);
        server.handle_frame(RX, &[0xA3, 0, 0, 0, 0, 0, 0, 0]);
        server.handle_frame(RX, &[0xA2, 4, 4, 0, 0, 0, 0, 0]);
        assert_eq!(server.state(ChannelId(0)).unwrap(), TransferState::BlockUploadBlock);
    }

    #[test]
    fn ack_beyond_window_aborts() {
        let mut server = server(&[0u8; 100]);
        server.handle_frame(RX, &[0xA4, 0x00, 0x21, 0x00, 4, 0, 0, 0]);
        server.handle_frame(RX, &[0xA3, 0, 0, 0, 0, 0, 0, 0]);
        server.poll();
        drain(&mut server);
        server.handle_frame(RX, &[0xA2, 9, 4, 0, 0, 0, 0, 0]);
        let abort = drain(&mut server);
        assert_eq!(frame::abort_code(&abort[0]), AbortReason::WrongSequenceNumber.code());
    }

    #[test]
    fn zero_block_size_is_refused() {
        let mut server = server(&[0u8; 100]);
        server.handle_frame(RX, &[0xA4, 0x00, 0x21, 0x00, 0, 0, 0, 0]);
        let abort = drain(&mut server);
        assert_eq!(frame::abort_code(&abort[0]), AbortReason::WrongBlockSize.code());
    }

    #[test]
    fn download_with_bad_crc_is_refused() {
        let mut server = server(b"old");
        server.handle_frame(RX, &[0xC6, 0x00, 0x21, 0x00, 10, 0, 0, 0]);
        assert_eq!(drain(&mut server), vec![[0xA4, 0x00, 0x21, 0x00, 4, 0, 0, 0]]);
        server.handle_frame(RX, &[0x01, 1, 2, 3, 4, 5, 6, 7]);
        server.handle_frame(RX, &[0x82, 8, 9, 10, 0, 0, 0, 0]);
        assert_eq!(drain(&mut server), vec![[0xA2, 2, 4, 0, 0, 0, 0, 0]]);
        server.handle_frame(RX, &[0xC1 | (4 << 2), 0xFF, 0xFF, 0, 0, 0, 0, 0]);
        let abort = drain(&mut server);
        assert_eq!(frame::abort_code(&abort[0]), AbortReason::CrcError.code());
        assert_eq!(server.store().value(BLOB), Some(&b"old"[..]));
    }

    #[test]
    fn download_commits_on_end() {
        let data: Vec<u8> = (1..=10).collect();
        let mut server = server(b"old");
        server.handle_frame(RX, &[0xC6, 0x00, 0x21, 0x00, 10, 0, 0, 0]);
        server.handle_frame(RX, &[0x01, 1, 2, 3, 4, 5, 6, 7]);
        // duplicate of segment 1 is dropped
        server.handle_frame(RX, &[0x01, 1, 2, 3, 4, 5, 6, 7]);
        server.handle_frame(RX, &[0x82, 8, 9, 10, 0, 0, 0, 0]);
        drain(&mut server);
        let crc = crc::checksum(&data).to_le_bytes();
        server.handle_frame(RX, &[0xC1 | (4 << 2), crc[0], crc[1], 0, 0, 0, 0, 0]);
        assert_eq!(drain(&mut server), vec![[0xA1, 0, 0, 0, 0, 0, 0, 0]]);
        assert_eq!(server.store().value(BLOB), Some(&data[..]));
    }
}
