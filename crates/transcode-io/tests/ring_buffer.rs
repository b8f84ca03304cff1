use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::TryStreamExt;
use transcode_io::buffer::{BufferReader, BufferSettings, ConnectionPolicy, ReadOutcome, RingBuffer, StopTarget};
use transcode_io::TranscodeError;
use ts_shift::TimestampShift;
use ts_shift::pes::{PREFIX_DTS, decode_timestamp, encode_timestamp};
use ts_shift::scr::PACK_START_CODE;

fn small_buffer(capacity: usize) -> Arc<RingBuffer> {
    let settings = BufferSettings::new(capacity).with_polling(Duration::from_millis(10), 5);
    RingBuffer::new(settings).unwrap()
}

async fn read_to_end(reader: &mut BufferReader, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        match reader.read(&mut buf).await.unwrap() {
            ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
            ReadOutcome::Eof => return out,
            ReadOutcome::Starved => {}
        }
    }
}

#[derive(Default)]
struct FakeOwner {
    ready: AtomicBool,
    destroyed: AtomicBool,
    stops: AtomicUsize,
}

impl StopTarget for FakeOwner {
    fn label(&self) -> &str {
        "fake-1"
    }

    fn set_ready_to_stop(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn is_ready_to_stop(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn stop_process(&self) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        !self.destroyed.swap(true, Ordering::SeqCst)
    }
}

#[tokio::test]
async fn wraps_many_times_without_losing_bytes() {
    let buffer = small_buffer(16);
    assert_eq!(buffer.threshold(), 12);
    let mut reader = buffer.attach_reader(0).unwrap();

    let data: Vec<u8> = (0..200u8).collect();
    let writer = {
        let buffer = buffer.clone();
        let data = data.clone();
        tokio::spawn(async move {
            for piece in data.chunks(7) {
                buffer.write(piece).await.unwrap();
            }
            buffer.close();
        })
    };

    let out = read_to_end(&mut reader, 5).await;
    writer.await.unwrap();
    assert_eq!(out, data);
    assert_eq!(buffer.write_position(), 200);
}

#[tokio::test]
async fn writer_waits_for_slow_reader() {
    let buffer = small_buffer(16);
    let writer = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.write(&[1u8; 20]).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(buffer.write_position(), 12);
    assert!(!writer.is_finished());

    let mut reader = buffer.attach_reader(0).unwrap();
    let mut buf = [0u8; 16];
    let mut total = 0;
    while total < 20 {
        if let ReadOutcome::Data(n) = reader.read(&mut buf).await.unwrap() {
            total += n;
        }
    }
    writer.await.unwrap().unwrap();
    assert_eq!(buffer.write_position(), 20);
}

#[tokio::test]
async fn eof_after_remaining_data() {
    let buffer = small_buffer(64);
    buffer.write(b"hello").await.unwrap();
    buffer.close();

    let mut reader = buffer.attach_reader(0).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf).await.unwrap(), ReadOutcome::Data(5));
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(reader.read(&mut buf).await.unwrap(), ReadOutcome::Eof);

    let err = buffer.write(b"late").await.unwrap_err();
    assert!(matches!(err, TranscodeError::BufferReleased));
}

#[tokio::test]
async fn starved_read_is_not_eof() {
    let buffer = small_buffer(64);
    let mut reader = buffer.attach_reader(0).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(reader.read(&mut buf).await.unwrap(), ReadOutcome::Starved);
    assert!(!buffer.is_eof());
}

#[tokio::test]
async fn first_read_waits_for_minimum() {
    let settings = BufferSettings::new(1024)
        .with_polling(Duration::from_millis(10), 20)
        .with_min_read(100, 0);
    let buffer = RingBuffer::new(settings).unwrap();
    let mut reader = buffer.attach_reader(0).unwrap();
    buffer.write(&[7u8; 40]).await.unwrap();

    let late = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            buffer.write(&[7u8; 100]).await.unwrap();
        })
    };

    let mut buf = [0u8; 512];
    assert_eq!(reader.read(&mut buf).await.unwrap(), ReadOutcome::Data(140));
    late.await.unwrap();
}

#[tokio::test]
async fn late_attach_starts_at_offset() {
    let buffer = small_buffer(64);
    let data: Vec<u8> = (0..30u8).collect();
    buffer.write(&data[..20]).await.unwrap();

    let mut reader = buffer.attach_reader(7).unwrap();
    buffer.write(&data[20..]).await.unwrap();
    buffer.close();

    assert_eq!(read_to_end(&mut reader, 4).await, &data[7..]);
}

#[tokio::test]
async fn overwritten_offset_moves_to_oldest_byte() {
    let buffer = small_buffer(16);
    let mut first = buffer.attach_reader(0).unwrap();
    let mut buf = [0u8; 16];

    buffer.write(&[1u8; 10]).await.unwrap();
    assert_eq!(first.read(&mut buf).await.unwrap(), ReadOutcome::Data(10));
    buffer.write(&[2u8; 10]).await.unwrap();

    // 20 written into 16 bytes: positions 0..4 are gone
    let mut second = buffer.attach_reader(2).unwrap();
    assert_eq!(second.position(), Some(4));
    assert_eq!(buffer.reader_count(), 2);

    // the newest reader paces the writer, the older one falls behind
    assert_eq!(second.read(&mut buf).await.unwrap(), ReadOutcome::Data(16));
    buffer.write(&[3u8; 12]).await.unwrap();
    let err = first.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, TranscodeError::Overrun { requested: 10, oldest: 16 }));
}

#[tokio::test]
async fn keep_first_refuses_second_reader() {
    let settings = BufferSettings::new(64).with_policy(ConnectionPolicy::KeepFirst);
    let buffer = RingBuffer::new(settings).unwrap();
    let _first = buffer.attach_reader(0).unwrap();
    assert!(buffer.attach_reader(0).is_none());
    assert_eq!(buffer.reader_count(), 1);
}

#[tokio::test]
async fn force_reconnect_closes_previous_reader() {
    let settings = BufferSettings::new(64)
        .with_policy(ConnectionPolicy::ForceReconnect)
        .with_polling(Duration::from_millis(10), 2);
    let buffer = RingBuffer::new(settings).unwrap();
    let mut first = buffer.attach_reader(0).unwrap();
    let second = buffer.attach_reader(0).unwrap();

    assert_eq!(buffer.reader_count(), 1);
    assert_eq!(first.position(), None);
    assert_eq!(second.position(), Some(0));
    let mut buf = [0u8; 8];
    assert!(matches!(first.read(&mut buf).await, Err(TranscodeError::ReaderClosed)));
}

#[tokio::test]
async fn allow_multiple_keeps_every_reader() {
    let buffer = small_buffer(64);
    buffer.write(b"abc").await.unwrap();
    let mut first = buffer.attach_reader(0).unwrap();
    let mut second = buffer.attach_reader(1).unwrap();
    buffer.close();

    assert_eq!(read_to_end(&mut first, 8).await, b"abc");
    assert_eq!(read_to_end(&mut second, 8).await, b"bc");
}

#[tokio::test]
async fn stream_yields_everything() {
    let buffer = small_buffer(4096);
    let reader = buffer.attach_reader(0).unwrap();
    buffer.write(b"first ").await.unwrap();
    buffer.write(b"second").await.unwrap();
    buffer.close();

    let chunks: Vec<_> = reader.into_stream().try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"first second");
}

#[tokio::test]
async fn idle_stream_times_out() {
    let settings = BufferSettings::new(64)
        .with_polling(Duration::from_millis(5), 2)
        .with_stream_idle_reads(2);
    let buffer = RingBuffer::new(settings).unwrap();
    let reader = buffer.attach_reader(0).unwrap();

    let result: Result<Vec<_>, _> = reader.into_stream().try_collect().await;
    assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::TimedOut);
}

#[tokio::test]
async fn last_reader_leaving_stops_owner() {
    let settings = BufferSettings::new(64).with_cleanup(true, Duration::from_millis(20));
    let buffer = RingBuffer::new(settings).unwrap();
    let owner = Arc::new(FakeOwner::default());
    let weak: std::sync::Weak<dyn StopTarget> = Arc::downgrade(&owner) as _;
    buffer.attach_owner(weak).unwrap();

    let reader = buffer.attach_reader(0).unwrap();
    drop(reader);
    assert!(owner.is_ready_to_stop());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(owner.stops.load(Ordering::SeqCst), 1);
    assert!(buffer.is_released());
}

#[tokio::test]
async fn returning_reader_cancels_cleanup() {
    let settings = BufferSettings::new(64).with_cleanup(true, Duration::from_millis(50));
    let buffer = RingBuffer::new(settings).unwrap();
    let owner = Arc::new(FakeOwner::default());
    let weak: std::sync::Weak<dyn StopTarget> = Arc::downgrade(&owner) as _;
    buffer.attach_owner(weak).unwrap();

    drop(buffer.attach_reader(0).unwrap());
    let _again = buffer.attach_reader(0).unwrap();
    assert!(!owner.is_ready_to_stop());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(owner.stops.load(Ordering::SeqCst), 0);
    assert!(!buffer.is_released());
}

#[tokio::test]
async fn reset_wakes_blocked_writer() {
    let buffer = small_buffer(16);
    let writer = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.write(&[0u8; 40]).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    buffer.reset();

    let result = writer.await.unwrap();
    assert!(matches!(result, Err(TranscodeError::BufferReleased)));
    assert_eq!(buffer.capacity(), 0);
    assert!(buffer.attach_reader(0).is_some());
}

fn padding_pes(total: usize) -> Vec<u8> {
    let mut packet = vec![0x00, 0x00, 0x01, 0xBE];
    packet.extend_from_slice(&((total - 6) as u16).to_be_bytes());
    packet.resize(total, 0xFF);
    packet
}

#[tokio::test]
async fn unpatched_bytes_stay_hidden() {
    let settings = BufferSettings::new(4096)
        .with_polling(Duration::from_millis(10), 3)
        .with_shift(Some(TimestampShift::new(450_000, false, true)));
    let buffer = RingBuffer::new(settings).unwrap();

    let mut stream = padding_pes(30);
    stream.extend_from_slice(&[0x00, 0x00, 0x01, 0xE0, 0x00, 0x0D, 0x80, 0xC0, 0x0A]);
    stream.extend_from_slice(&encode_timestamp(90_000, 0x3));
    stream.extend_from_slice(&encode_timestamp(87_000, PREFIX_DTS));

    let mut reader = buffer.attach_reader(0).unwrap();
    buffer.write(&stream[..35]).await.unwrap();
    assert_eq!(buffer.visible_position(), 30);

    let mut buf = [0u8; 64];
    assert_eq!(reader.read(&mut buf).await.unwrap(), ReadOutcome::Data(30));

    buffer.write(&stream[35..]).await.unwrap();
    assert_eq!(buffer.visible_position(), 49);
    assert_eq!(reader.read(&mut buf).await.unwrap(), ReadOutcome::Data(19));

    let pts: [u8; 5] = buf[9..14].try_into().unwrap();
    let dts: [u8; 5] = buf[14..19].try_into().unwrap();
    assert_eq!(decode_timestamp(&pts), 540_000);
    assert_eq!(decode_timestamp(&dts), 537_000);
    assert_eq!(buffer.patch_stats().unwrap().pts_fields, 1);
}

fn video_pes(pts: u64, dts: u64) -> Vec<u8> {
    let mut packet = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x0D, 0x80, 0xC0, 0x0A];
    packet.extend_from_slice(&encode_timestamp(pts, 0x3));
    packet.extend_from_slice(&encode_timestamp(dts, PREFIX_DTS));
    packet
}

#[tokio::test]
async fn header_is_not_shifted() {
    // a header that happens to contain a pack start code
    let mut header = PACK_START_CODE.to_vec();
    header.extend_from_slice(&[0x44, 0x00, 0xDD, 0xDD, 0x04, 0x01]);
    let settings = BufferSettings::new(4096)
        .with_polling(Duration::from_millis(10), 3)
        .with_shift(Some(TimestampShift::new(450_000, true, true)))
        .with_header_len(header.len() as u64);
    let buffer = RingBuffer::new(settings).unwrap();

    buffer.write(&header).await.unwrap();
    buffer.write(&video_pes(90_000, 87_000)).await.unwrap();
    buffer.close();

    let mut reader = buffer.attach_reader(0).unwrap();
    let out = read_to_end(&mut reader, 64).await;
    assert_eq!(&out[..header.len()], &header[..]);
    let packet = &out[header.len()..];
    assert_eq!(decode_timestamp(&packet[9..14].try_into().unwrap()), 540_000);
    assert_eq!(decode_timestamp(&packet[14..19].try_into().unwrap()), 537_000);
    let stats = buffer.patch_stats().unwrap();
    assert_eq!((stats.scr_fields, stats.pts_fields), (0, 1));
}

#[tokio::test]
async fn debug_copy_matches_written_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.bin");
    let buffer = RingBuffer::new(
        BufferSettings::new(16)
            .with_polling(Duration::from_millis(10), 5)
            .with_debug_dump(&path),
    )
    .unwrap();
    assert!(!path.exists());

    let data: Vec<u8> = (0..100u8).collect();
    let mut reader = buffer.attach_reader(0).unwrap();
    let writer = {
        let buffer = buffer.clone();
        let data = data.clone();
        tokio::spawn(async move {
            for chunk in data.chunks(7) {
                buffer.write(chunk).await.unwrap();
            }
            buffer.close();
        })
    };
    assert_eq!(read_to_end(&mut reader, 5).await, data);
    writer.await.unwrap();

    assert!(buffer.is_dumping());
    assert_eq!(std::fs::read(&path).unwrap(), data);

    buffer.reset();
    assert!(!buffer.is_dumping());
}

#[tokio::test]
async fn unwritable_debug_copy_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let settings = BufferSettings::new(64)
        .with_polling(Duration::from_millis(10), 5)
        .with_debug_dump(dir.path().join("missing").join("dump.bin"));
    let buffer = RingBuffer::new(settings).unwrap();

    buffer.write(b"still buffered").await.unwrap();
    buffer.close();
    assert!(!buffer.is_dumping());

    let mut reader = buffer.attach_reader(0).unwrap();
    assert_eq!(read_to_end(&mut reader, 64).await, b"still buffered");
}

#[tokio::test]
async fn stream_chunks_are_sized_to_the_data() {
    let buffer = small_buffer(64);
    buffer.write(b"abc").await.unwrap();
    buffer.close();

    let chunks: Vec<_> = buffer.attach_reader(0).unwrap().into_stream().try_collect().await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(&chunks[0][..], b"abc");
}
