//! Block upload and block download on the client side.

use log::{debug, trace};

use super::{ClientChannel, Ctx};
use crate::abort::AbortReason;
use crate::channel::TransferState;
use crate::frame::{
    self, ClientCommand, Frame, BLOCK_CRC_FLAG, BLOCK_LAST_FLAG, BLOCK_SEQ_MASK, BLOCK_SIZE_INDICATED_FLAG,
    BLOCK_SUB_END, BLOCK_SUB_START, MAX_BLOCK_SIZE, SEGMENT_DATA_LEN,
};
use crate::transport::{TransmitError, Transport};

impl ClientChannel {
    pub(super) fn block_upload_init_response<T: Transport>(
        &mut self,
        ctx: &mut Ctx<'_, T>,
        response: &Frame,
    ) -> Result<(), AbortReason> {
        if self.state != TransferState::BlockUploadInit {
            return Err(AbortReason::UnknownCommand);
        }
        self.check_address(response)?;
        let command = response[0];
        if command & BLOCK_SIZE_INDICATED_FLAG != 0 {
            let size = frame::size_field(response) as usize;
            if size > self.limit {
                return Err(AbortReason::DataTypeMismatch);
            }
            self.total = size;
            self.size_known = true;
        }
        self.crc_enabled = command & BLOCK_CRC_FLAG != 0 && ctx.config.block_crc;
        self.crc.reset();
        self.cursor = 0;
        self.seq = 0;
        self.last_segment = None;
        self.state = TransferState::BlockUploadBlock;
        debug!(
            "SDO client {}: block upload of {} ({} bytes, crc {})",
            self.id,
            self.address,
            if self.size_known { self.total } else { 0 },
            self.crc_enabled
        );
        self.send(ctx, &[ClientCommand::BlockUpload as u8 | BLOCK_SUB_START, 0, 0, 0, 0, 0, 0, 0])
    }

    /// Collect one segment of the current window.
    pub(super) fn receive_block_segment<T: Transport>(
        &mut self,
        ctx: &mut Ctx<'_, T>,
        segment: &Frame,
    ) -> Result<(), AbortReason> {
        let seq = segment[0] & BLOCK_SEQ_MASK;
        let last = segment[0] & BLOCK_LAST_FLAG != 0;

        if seq == self.seq + 1 {
            self.seq = seq;
            if last {
                let mut tail = [0u8; SEGMENT_DATA_LEN];
                tail.copy_from_slice(&segment[1..]);
                self.last_segment = Some(tail);
            } else {
                if self.cursor + SEGMENT_DATA_LEN > self.total {
                    return Err(AbortReason::DataTypeMismatch);
                }
                self.buffer.extend_from_slice(&segment[1..]);
                self.crc.feed(self.cursor, &segment[1..]);
                self.cursor += SEGMENT_DATA_LEN;
            }
        } else {
            trace!("SDO client {}: segment {} out of order, expected {}", self.id, seq, self.seq + 1);
        }

        if last || seq >= self.block_size {
            let ack = frame::block_ack(ClientCommand::BlockUpload as u8, self.seq, ctx.config.block_size);
            self.block_size = ctx.config.block_size;
            self.seq = 0;
            self.state = if self.last_segment.is_some() {
                TransferState::BlockUploadEnd
            } else {
                TransferState::BlockUploadBlock
            };
            return self.send(ctx, &ack);
        }
        Ok(())
    }

    pub(super) fn block_upload_end<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, response: &Frame) -> Result<(), AbortReason> {
        if self.state != TransferState::BlockUploadEnd {
            return Err(AbortReason::UnknownCommand);
        }
        let tail = self.last_segment.take().ok_or(AbortReason::UnknownCommand)?;
        let len = SEGMENT_DATA_LEN - frame::block_end_unused(response[0]);
        if self.cursor + len > self.total {
            return Err(AbortReason::DataTypeMismatch);
        }
        self.buffer.extend_from_slice(&tail[..len]);
        self.crc.feed(self.cursor, &tail[..len]);
        self.cursor += len;
        if self.size_known && self.cursor != self.total {
            return Err(AbortReason::DataTypeMismatch);
        }
        if self.crc_enabled && self.crc.value() != frame::block_end_crc(response) {
            return Err(AbortReason::CrcError);
        }
        self.send(ctx, &[ClientCommand::BlockUpload as u8 | BLOCK_SUB_END, 0, 0, 0, 0, 0, 0, 0])?;
        self.complete_read(ctx);
        Ok(())
    }

    pub(super) fn block_download_init_response<T: Transport>(
        &mut self,
        ctx: &mut Ctx<'_, T>,
        response: &Frame,
    ) -> Result<(), AbortReason> {
        if self.state != TransferState::BlockDownloadInit {
            return Err(AbortReason::UnknownCommand);
        }
        self.check_address(response)?;
        let block_size = response[4];
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(AbortReason::WrongBlockSize);
        }
        self.block_size = block_size;
        self.crc_enabled = response[0] & BLOCK_CRC_FLAG != 0 && ctx.config.block_crc;
        self.crc.reset();
        self.cursor = 0;
        self.window_start = 0;
        self.seq = 0;
        self.last_sent = false;
        self.state = TransferState::BlockDownloadBlock;
        debug!(
            "SDO client {}: block download of {} bytes to {}, blksize {}",
            self.id, self.total, self.address, block_size
        );
        Ok(())
    }

    /// Send segments of the current window until it is complete or the
    /// transmit buffer is too full.
    pub(super) fn stream_block<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>) -> Result<(), AbortReason> {
        let tx = self.binding.tx().ok_or(AbortReason::General)?;
        while self.state == TransferState::BlockDownloadBlock {
            if ctx.transport.fill_percent() > ctx.config.tx_pressure_percent {
                return Ok(());
            }
            let len = SEGMENT_DATA_LEN.min(self.total - self.cursor);
            let data = &self.buffer[self.cursor..self.cursor + len];
            let last = self.cursor + len == self.total;
            let segment = frame::block_segment(self.seq + 1, last, data);
            match ctx.transport.send(tx, &segment) {
                Ok(()) => {}
                Err(TransmitError::BufferFull) => return Ok(()),
                Err(_) => return Err(AbortReason::OutOfMemory),
            }
            self.crc.feed(self.cursor, data);
            self.cursor += len;
            self.seq += 1;
            if last || self.seq >= self.block_size {
                self.last_sent = last;
                self.state = TransferState::BlockDownloadAck;
            }
            self.touch(ctx.now);
        }
        Ok(())
    }

    pub(super) fn block_download_ack<T: Transport>(&mut self, ctx: &mut Ctx<'_, T>, response: &Frame) -> Result<(), AbortReason> {
        match self.state {
            TransferState::BlockDownloadAck => {}
            // late or duplicate acknowledge
            TransferState::BlockDownloadBlock | TransferState::BlockDownloadEnd => return Ok(()),
            _ => return Err(AbortReason::UnknownCommand),
        }
        let ack = response[1];
        let next_size = response[2];
        if ack > MAX_BLOCK_SIZE || ack > self.seq {
            return Err(AbortReason::WrongSequenceNumber);
        }
        if ack == self.seq && self.last_sent {
            let crc = self.crc_enabled.then(|| self.crc.value());
            let unused = frame::unused_in_last_segment(self.total);
            let end = frame::block_end(ClientCommand::BlockDownload as u8, unused, crc);
            self.state = TransferState::BlockDownloadEnd;
            return self.send(ctx, &end);
        }
        if next_size == 0 || next_size > MAX_BLOCK_SIZE {
            return Err(AbortReason::WrongBlockSize);
        }
        self.cursor = (self.window_start + ack as usize * SEGMENT_DATA_LEN).min(self.total);
        self.window_start = self.cursor;
        if (ack as usize) < self.seq as usize {
            debug!("SDO client {}: server confirmed {} of {} segments", self.id, ack, self.seq);
        }
        self.block_size = next_size;
        self.seq = 0;
        self.last_sent = false;
        self.state = TransferState::BlockDownloadBlock;
        Ok(())
    }

    pub(super) fn block_download_end<T>(&mut self, ctx: &mut Ctx<'_, T>) -> Result<(), AbortReason> {
        if self.state != TransferState::BlockDownloadEnd {
            return Err(AbortReason::UnknownCommand);
        }
        self.finish(ctx, Ok(()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::abort::{AbortCode, AbortReason};
    use crate::channel::{ChannelId, TransferState};
    use crate::client::{SdoClient, TransferOptions};
    use crate::config::SdoConfig;
    use crate::crc;
    use crate::frame::{self, Frame, ObjectAddress};
    use crate::timer::ManualClock;
    use crate::transport::FrameQueue;

    const RX: u16 = 0x586;
    const BLOB: ObjectAddress = ObjectAddress::new(0x2100, 0);

    type Client = SdoClient<FrameQueue, ManualClock>;
    type Results = Rc<RefCell<Vec<(Vec<u8>, Result<(), AbortCode>)>>>;

    fn client() -> (Client, Results) {
        let config = SdoConfig {
            block_threshold: 16,
            block_size: 4,
            ..SdoConfig::default()
        };
        let mut client = SdoClient::new(config, FrameQueue::new(64), ManualClock::new()).unwrap();
        client.bind_server(ChannelId(0), 6).unwrap();
        let results: Results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        client.on_read(move |outcome| sink.borrow_mut().push((outcome.data.to_vec(), outcome.result)));
        let sink = results.clone();
        client.on_write(move |outcome| sink.borrow_mut().push((Vec::new(), outcome.result)));
        (client, results)
    }

    fn drain(client: &mut Client) -> Vec<Frame> {
        client.transport_mut().drain().map(|(_, f)| f).collect()
    }

    fn segment(seq: u8, last: bool, data: &[u8]) -> Frame {
        frame::block_segment(seq, last, data)
    }

    #[test]
    fn upload_acks_last_in_order_segment() {
        let (mut client, results) = client();
        client.read(ChannelId(0), BLOB, 64, TransferOptions::new(100)).unwrap();
        let init = drain(&mut client);
        assert_eq!(init[0][0], 0xA4);
        assert_eq!(init[0][4], 4);

        client.handle_frame(RX, &[0xC6, 0x00, 0x21, 0x00, 20, 0, 0, 0]);
        assert_eq!(drain(&mut client), vec![[0xA3, 0, 0, 0, 0, 0, 0, 0]]);

        let value: Vec<u8> = (1..=20).collect();
        client.handle_frame(RX, &segment(1, false, &value[0..7]));
        // segment 2 lost
        client.handle_frame(RX, &segment(3, true, &value[14..20]));
        assert_eq!(drain(&mut client), vec![[0xA2, 1, 4, 0, 0, 0, 0, 0]]);
        assert_eq!(client.state(ChannelId(0)).unwrap(), TransferState::BlockUploadBlock);

        client.handle_frame(RX, &segment(1, false, &value[7..14]));
        client.handle_frame(RX, &segment(2, true, &value[14..20]));
        assert_eq!(drain(&mut client), vec![[0xA2, 2, 4, 0, 0, 0, 0, 0]]);

        let end = frame::block_end(0xC0, 1, Some(crc::checksum(&value)));
        client.handle_frame(RX, &end);
        assert_eq!(drain(&mut client), vec![[0xA1, 0, 0, 0, 0, 0, 0, 0]]);
        assert_eq!(*results.borrow(), vec![(value, Ok(()))]);
    }

    #[test]
    fn upload_crc_mismatch_aborts() {
        let (mut client, results) = client();
        client.read(ChannelId(0), BLOB, 64, TransferOptions::new(100)).unwrap();
        client.handle_frame(RX, &[0xC6, 0x00, 0x21, 0x00, 3, 0, 0, 0]);
        drain(&mut client);
        client.handle_frame(RX, &segment(1, true, &[1, 2, 3]));
        drain(&mut client);
        client.handle_frame(RX, &frame::block_end(0xC0, 4, Some(0xBEEF)));
        let abort = drain(&mut client);
        assert_eq!(frame::abort_code(&abort[0]), AbortReason::CrcError.code());
        assert_eq!(results.borrow()[0].1, Err(AbortReason::CrcError.code()));
    }

    #[test]
    fn refused_block_upload_falls_back_to_segmented() {
        let (mut client, results) = client();
        client.read(ChannelId(0), BLOB, 64, TransferOptions::new(100)).unwrap();
        drain(&mut client);
        client.handle_frame(RX, &frame::abort(BLOB, AbortReason::UnknownCommand.code()));
        assert_eq!(drain(&mut client), vec![[0x40, 0x00, 0x21, 0x00, 0, 0, 0, 0]]);
        assert!(results.borrow().is_empty());

        // second refusal is final
        client.handle_frame(RX, &frame::abort(BLOB, AbortReason::UnknownCommand.code()));
        assert!(drain(&mut client).is_empty());
        assert_eq!(results.borrow()[0].1, Err(AbortReason::UnknownCommand.code()));
    }

    #[test]
    fn download_streams_windows_from_poll() {
        let (mut client, results) = client();
        let value: Vec<u8> = (0..40).collect();
        client.write(ChannelId(0), BLOB, &value, TransferOptions::new(100)).unwrap();
        let init = drain(&mut client);
        assert_eq!(init[0][0], 0xC6);
        assert_eq!(frame::size_field(&init[0]), 40);

        client.handle_frame(RX, &[0xA4, 0x00, 0x21, 0x00, 3, 0, 0, 0]);
        assert!(drain(&mut client).is_empty());
        client.poll();
        let window = drain(&mut client);
        assert_eq!(window.len(), 3);
        assert_eq!(window[2][0], 3);

        // late duplicate is ignored while streaming
        client.handle_frame(RX, &[0xA2, 3, 3, 0, 0, 0, 0, 0]);
        client.handle_frame(RX, &[0xA2, 3, 3, 0, 0, 0, 0, 0]);
        assert_eq!(client.state(ChannelId(0)).unwrap(), TransferState::BlockDownloadBlock);
        client.poll();
        let window = drain(&mut client);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0][1], 21);

        // server missed the last segment of the window
        client.handle_frame(RX, &[0xA2, 2, 3, 0, 0, 0, 0, 0]);
        client.poll();
        assert_eq!(drain(&mut client), vec![segment(1, true, &value[35..40])]);

        client.handle_frame(RX, &[0xA2, 1, 3, 0, 0, 0, 0, 0]);
        let end = drain(&mut client);
        assert_eq!(end[0][0], 0xC1 | (2 << 2));
        assert_eq!(frame::block_end_crc(&end[0]), crc::checksum(&value));

        client.handle_frame(RX, &[0xA1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(results.borrow()[0].1, Ok(()));
    }

    #[test]
    fn download_rejects_bad_block_size() {
        let (mut client, results) = client();
        client.write(ChannelId(0), BLOB, &[0; 20], TransferOptions::new(100)).unwrap();
        drain(&mut client);
        client.handle_frame(RX, &[0xA4, 0x00, 0x21, 0x00, 0, 0, 0, 0]);
        let abort = drain(&mut client);
        assert_eq!(frame::abort_code(&abort[0]), AbortReason::WrongBlockSize.code());
        assert_eq!(results.borrow().len(), 1);
    }
}
