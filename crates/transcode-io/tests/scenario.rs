//! A transcoder writing faster than a late HTTP client reads.

use std::time::Duration;

use transcode_io::buffer::{BufferSettings, ReadOutcome, RingBuffer};

const TOTAL: usize = 2_000_000;
const WRITE_CHUNK: usize = 64 * 1024;
const READ_CHUNK: usize = 32 * 1024;

fn pattern(pos: usize) -> u8 {
    (pos % 251) as u8
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_reader_receives_whole_stream() {
    let settings = BufferSettings::new(1_048_576)
        .with_min_read(104_857, 0)
        .with_polling(Duration::from_millis(10), 50);
    let buffer = RingBuffer::new(settings).unwrap();
    let threshold = buffer.threshold();
    assert_eq!(threshold, 448_576);

    let writer = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            let data: Vec<u8> = (0..TOTAL).map(pattern).collect();
            for piece in data.chunks(WRITE_CHUNK) {
                buffer.write(piece).await.unwrap();
            }
            buffer.close();
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    // nobody reading yet: the writer stops at the threshold
    assert_eq!(buffer.write_position(), threshold as u64);

    let mut reader = buffer.attach_reader(0).unwrap();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut received = 0usize;
    loop {
        match reader.read(&mut buf).await.unwrap() {
            ReadOutcome::Data(n) => {
                for (i, byte) in buf[..n].iter().enumerate() {
                    assert_eq!(*byte, pattern(received + i), "mismatch at {}", received + i);
                }
                received += n;
            }
            ReadOutcome::Eof => break,
            ReadOutcome::Starved => {}
        }
    }

    writer.await.unwrap();
    assert_eq!(received, TOTAL);
    assert_eq!(buffer.write_position(), TOTAL as u64);
}
