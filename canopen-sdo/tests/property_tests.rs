//! Property tests for the codecs and for complete client/server transfers.

use canopen_sdo::crc::{self, Crc};
use canopen_sdo::frame::{self, ObjectAddress, SEGMENT_DATA_LEN};
use canopen_sdo::{
    AbortReason, Access, ChannelId, Frame, FrameQueue, ManualClock, MemoryStore, SdoClient, SdoConfig, SdoServer,
    TransferOptions,
};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

const NODE: u8 = 12;
const BLOB: ObjectAddress = ObjectAddress::new(0x2200, 0);

type Server = SdoServer<FrameQueue, MemoryStore, ManualClock>;
type Client = SdoClient<FrameQueue, ManualClock>;

fn pair(config: SdoConfig) -> (Server, Client) {
    let clock = ManualClock::new();
    let mut store = MemoryStore::new();
    store.insert(BLOB, &[], 1024, Access::READ_WRITE);
    let server = SdoServer::new(config.clone(), NODE, FrameQueue::new(256), store, clock.clone()).unwrap();
    let mut client = SdoClient::new(config, FrameQueue::new(256), clock).unwrap();
    client.bind_server(ChannelId(0), NODE).unwrap();
    (server, client)
}

fn pump(server: &mut Server, client: &mut Client, mut keep: impl FnMut(u16, &Frame) -> bool) {
    for _ in 0..10_000 {
        server.poll();
        client.poll();
        let requests: Vec<_> = client.transport_mut().drain().collect();
        let responses: Vec<_> = server.transport_mut().drain().collect();
        if requests.is_empty() && responses.is_empty() {
            return;
        }
        for (cob, f) in requests.iter().filter(|(cob, f)| keep(*cob, f)) {
            server.handle_frame(*cob, f);
        }
        for (cob, f) in responses {
            client.handle_frame(cob, &f);
        }
    }
    panic!("bus never went quiet");
}

fn collect_reads(client: &mut Client) -> Rc<RefCell<Vec<Vec<u8>>>> {
    let reads = Rc::new(RefCell::new(Vec::new()));
    let sink = reads.clone();
    client.on_read(move |outcome| {
        if outcome.result.is_ok() {
            sink.borrow_mut().push(outcome.data.to_vec());
        }
    });
    reads
}

/// Bit-at-a-time CRC-CCITT, seed 0.
fn crc_bitwise(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

// ── Codecs ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn crc_matches_bitwise_reference(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        prop_assert_eq!(crc::checksum(&data), crc_bitwise(&data));
    }

    /// Feeding the CRC in arbitrary pieces, with retransmitted pieces in
    /// between, gives the checksum of the whole buffer.
    #[test]
    fn crc_ignores_retransmissions(
        data in proptest::collection::vec(any::<u8>(), 0..300),
        piece in 1usize..=SEGMENT_DATA_LEN,
    ) {
        let mut acc = Crc::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + piece).min(data.len());
            acc.feed(offset, &data[offset..end]);
            // the same piece again, as after a rewind
            acc.feed(offset, &data[offset..end]);
            offset = end;
        }
        prop_assert_eq!(acc.value(), crc::checksum(&data));
        prop_assert_eq!(acc.covered(), data.len());
    }

    #[test]
    fn last_segment_fills_the_size(size in 0usize..10_000) {
        let unused = frame::unused_in_last_segment(size);
        prop_assert!(unused <= SEGMENT_DATA_LEN);
        prop_assert_eq!((size + unused) % SEGMENT_DATA_LEN, 0);
        if size > 0 {
            prop_assert!(unused < SEGMENT_DATA_LEN);
        }
    }

    #[test]
    fn expedited_frames_keep_length(
        value in proptest::collection::vec(any::<u8>(), 1..=4),
        index in any::<u16>(),
        sub_index in any::<u8>(),
    ) {
        let address = ObjectAddress::new(index, sub_index);
        let request = frame::expedited(0x20, address, &value);
        prop_assert_eq!(ObjectAddress::decode(&request), address);
        prop_assert_eq!(frame::expedited_len(request[0]), value.len());
        prop_assert_eq!(&request[4..4 + value.len()], &value[..]);
    }
}

#[test]
fn every_abort_reason_survives_the_wire() {
    for reason in AbortReason::all() {
        let abort = frame::abort(BLOB, reason.code());
        assert!(frame::is_abort(&abort));
        assert_eq!(frame::abort_code(&abort).reason(), reason);
    }
}

// ── Transfers ─────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the size, a write followed by a read returns the value,
    /// whichever protocol the client picks.
    #[test]
    fn write_then_read_back(
        value in proptest::collection::vec(any::<u8>(), 0..800),
        threshold in 8usize..200,
        block_size in 1u8..=127,
        block_crc in any::<bool>(),
    ) {
        let config = SdoConfig { block_threshold: threshold, block_size, block_crc, ..SdoConfig::default() };
        let (mut server, mut client) = pair(config);
        let reads = collect_reads(&mut client);
        let options = TransferOptions::new(100);

        client.write(ChannelId(0), BLOB, &value, options).unwrap();
        pump(&mut server, &mut client, |_, _| true);
        prop_assert_eq!(server.store().value(BLOB), Some(&value[..]));

        client.read(ChannelId(0), BLOB, 1024, options).unwrap();
        pump(&mut server, &mut client, |_, _| true);
        prop_assert_eq!(reads.borrow().clone(), vec![value]);
    }

    /// Block download survives segments lost in the middle of a window.
    #[test]
    fn block_download_with_losses(
        value in proptest::collection::vec(any::<u8>(), 64..800),
        lost_seq in 1u8..20,
        losses in 1usize..6,
    ) {
        let config = SdoConfig { block_threshold: 64, block_size: 20, ..SdoConfig::default() };
        let (mut server, mut client) = pair(config);
        client.write(ChannelId(0), BLOB, &value, TransferOptions::new(100)).unwrap();

        let client_tx = 0x600 + NODE as u16;
        let mut left = losses;
        pump(&mut server, &mut client, |cob, f| {
            // a plain sequence number never carries the last flag
            if cob == client_tx && f[0] == lost_seq && left > 0 {
                left -= 1;
                return false;
            }
            true
        });
        prop_assert_eq!(server.store().value(BLOB), Some(&value[..]));
        prop_assert!(client.state(ChannelId(0)).unwrap().is_free());
    }

    /// Arbitrary frames never wedge the server: whatever it is fed, an
    /// abort from the client frees the channel.
    #[test]
    fn server_survives_garbage(
        frames in proptest::collection::vec(any::<[u8; 8]>(), 1..40),
    ) {
        let (mut server, _) = pair(SdoConfig::default());
        let rx = 0x600 + NODE as u16;
        for f in &frames {
            server.handle_frame(rx, f);
            server.poll();
        }
        server.handle_frame(rx, &frame::abort(BLOB, AbortReason::General.code()));
        prop_assert!(server.state(ChannelId(0)).unwrap().is_free());
    }
}
