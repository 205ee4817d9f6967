//! Accumulates ticks across batch boundaries until the downstream insert
//! size is reached or the buffer has sat idle too long.
//!
//! Downstream indexers have optimal insert sizes unrelated to the write
//! side's batch size, so flushes are cut to exactly `insert_batch_size`
//! ticks. A batch filename travels with its ticks and is reported back only
//! in the flush that drains the last of them; completion marks must never
//! run ahead of the data.

use std::{
    collections::VecDeque,
    time::Duration,
};

use common::{
    runtime::Runtime,
    types::{
        BatchFileName,
        TickRecord,
    },
};
use tokio::time::Instant;

struct Segment {
    filename: BatchFileName,
    ticks: VecDeque<TickRecord>,
}

/// One flush worth of work: the ticks to hand to the processor, and the
/// batch files that are fully drained once these ticks are written.
pub struct FlushPayload {
    pub ticks: Vec<TickRecord>,
    pub filenames: Vec<BatchFileName>,
}

pub struct TickBuffer<RT: Runtime> {
    rt: RT,
    insert_batch_size: usize,
    flush_timeout: Duration,
    segments: VecDeque<Segment>,
    buffered: usize,
    last_flush: Instant,
}

impl<RT: Runtime> TickBuffer<RT> {
    pub fn new(rt: RT, insert_batch_size: usize, flush_timeout: Duration) -> Self {
        let last_flush = rt.monotonic_now();
        Self {
            rt,
            insert_batch_size,
            flush_timeout,
            segments: VecDeque::new(),
            buffered: 0,
            last_flush,
        }
    }

    pub fn append(&mut self, filename: BatchFileName, ticks: Vec<TickRecord>) {
        self.buffered += ticks.len();
        self.segments.push_back(Segment {
            filename,
            ticks: ticks.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// The next size-triggered flush, exactly `insert_batch_size` ticks.
    /// Call repeatedly until `None`; one large batch can produce several
    /// flushes.
    pub fn take_if_full(&mut self) -> Option<FlushPayload> {
        if self.buffered < self.insert_batch_size {
            return None;
        }
        Some(self.take(self.insert_batch_size))
    }

    /// Everything buffered, if the buffer is non-empty and no flush happened
    /// within the idle timeout.
    pub fn take_if_idle(&mut self) -> Option<FlushPayload> {
        if self.buffered == 0
            || self.rt.monotonic_now().saturating_duration_since(self.last_flush)
                < self.flush_timeout
        {
            return None;
        }
        Some(self.take(self.buffered))
    }

    /// Everything buffered, for graceful shutdown.
    pub fn take_remaining(&mut self) -> Option<FlushPayload> {
        if self.buffered == 0 {
            return None;
        }
        Some(self.take(self.buffered))
    }

    fn take(&mut self, mut wanted: usize) -> FlushPayload {
        let mut payload = FlushPayload {
            ticks: Vec::with_capacity(wanted),
            filenames: Vec::new(),
        };
        while wanted > 0 {
            let segment = self
                .segments
                .front_mut()
                .expect("buffered count out of sync with segments");
            if segment.ticks.len() <= wanted {
                wanted -= segment.ticks.len();
                payload.ticks.extend(std::mem::take(&mut segment.ticks));
                let segment = self.segments.pop_front().expect("peeked above");
                payload.filenames.push(segment.filename);
            } else {
                payload.ticks.extend(segment.ticks.drain(..wanted));
                wanted = 0;
            }
        }
        self.buffered -= payload.ticks.len();
        self.last_flush = self.rt.monotonic_now();
        payload
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::{
        runtime::testing::TestRuntime,
        types::{
            BatchFileName,
            TickRange,
            TickRecord,
        },
    };

    use super::TickBuffer;

    fn batch(start: i64, count: usize) -> (BatchFileName, Vec<TickRecord>) {
        let interval = 10;
        let ticks: Vec<_> = (0..count as i64)
            .map(|n| TickRecord {
                tick_number: start + n * interval,
                payload: vec![],
            })
            .collect();
        let range = TickRange::new(start, start + (count as i64 - 1) * interval).unwrap();
        (BatchFileName::from_range(range), ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_inserts_split_one_batch() {
        let rt = TestRuntime::new();
        let mut buffer = TickBuffer::new(rt, 500, Duration::from_secs(5));
        let (name, ticks) = batch(0, 1000);
        buffer.append(name.clone(), ticks);

        let first = buffer.take_if_full().expect("first flush");
        assert_eq!(first.ticks.len(), 500);
        // The batch still has ticks in the buffer, so it is not reported yet.
        assert!(first.filenames.is_empty());

        let second = buffer.take_if_full().expect("second flush");
        assert_eq!(second.ticks.len(), 500);
        assert_eq!(second.filenames, vec![name]);

        assert!(buffer.take_if_full().is_none());
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_inserts_span_batches() {
        let rt = TestRuntime::new();
        let mut buffer = TickBuffer::new(rt, 5000, Duration::from_secs(5));
        let mut names = Vec::new();
        for n in 0..10 {
            let (name, ticks) = batch(n * 10_000, 1000);
            names.push(name.clone());
            buffer.append(name, ticks);
            if n < 4 {
                assert!(buffer.take_if_full().is_none());
            }
        }
        let first = buffer.take_if_full().expect("first flush");
        assert_eq!(first.ticks.len(), 5000);
        assert_eq!(first.filenames, names[..5].to_vec());
        let second = buffer.take_if_full().expect("second flush");
        assert_eq!(second.filenames, names[5..].to_vec());
        assert!(buffer.take_if_full().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flush_fires_after_timeout() {
        let rt = TestRuntime::new();
        let mut buffer = TickBuffer::new(rt.clone(), 1000, Duration::from_secs(5));
        let (name, ticks) = batch(0, 10);
        buffer.append(name, ticks);

        assert!(buffer.take_if_idle().is_none());
        rt.advance(Duration::from_secs(6)).await;
        let payload = buffer.take_if_idle().expect("idle flush");
        assert_eq!(payload.ticks.len(), 10);
        assert_eq!(payload.filenames.len(), 1);
        assert!(buffer.take_if_idle().is_none());
    }
}
