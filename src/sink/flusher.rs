//! Drains the `DeliveryQueue` onto the graphite stream.

use crate::config::Config;
use crate::protocols::graphite;
use crate::queue::DeliveryQueue;
use crate::sink::connection::{Acquire, ConnectionManager, Connector};
use std::io;
use std::io::Write;
use std::ops::AddAssign;
use std::sync::mpsc;
use std::cmp;
use std::thread;
use std::time::{Duration, Instant};

/// Most bytes the encode buffer preallocates, whatever the chunk size.
const MAX_BUFFER_PREALLOC: usize = 64 * 1024;

/// Counts from one or more flush cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Batches written successfully.
    pub batches: usize,
    /// Lines written successfully.
    pub delivered: usize,
    /// Samples with nothing to send, see `protocols::graphite::encode_into`.
    pub skipped: usize,
    /// Batch writes that failed and were put back on the queue.
    pub write_failures: usize,
    /// Samples left queued because no connection was available.
    pub deferred: usize,
}

impl AddAssign for FlushStats {
    fn add_assign(&mut self, other: FlushStats) {
        self.batches += other.batches;
        self.delivered += other.delivered;
        self.skipped += other.skipped;
        self.write_failures += other.write_failures;
        self.deferred += other.deferred;
    }
}

/// The single consumer of a `DeliveryQueue`.
///
/// Every tick the flusher takes batches of at most `chunk_size` samples off
/// the front of the queue, encodes each batch into one buffer and writes it
/// with a single `write_all` and `flush`. A batch whose write fails goes back
/// to the front of the queue whole, so nothing is reordered, and the cycle
/// ends until the connection recovers.
pub struct Flusher<C: Connector> {
    queue: DeliveryQueue,
    connection: ConnectionManager<C>,
    chunk_size: usize,
    flush_interval: Duration,
    final_flush_timeout: Duration,
    buffer: String,
    stats: FlushStats,
    last_dropped: usize,
}

impl<C: Connector> Flusher<C> {
    /// Create a `Flusher` draining `queue` through `connection`.
    pub fn new(queue: DeliveryQueue, connection: ConnectionManager<C>, config: &Config) -> Flusher<C> {
        let chunk_size = if config.chunk_size == 0 { 1 } else { config.chunk_size };
        Flusher {
            queue: queue,
            connection: connection,
            chunk_size: chunk_size,
            flush_interval: config.flush_interval,
            final_flush_timeout: config.socket_timeout,
            buffer: String::with_capacity(cmp::min(
                chunk_size.saturating_mul(64),
                MAX_BUFFER_PREALLOC,
            )),
            stats: FlushStats::default(),
            last_dropped: 0,
        }
    }

    /// Counts accumulated over every cycle so far.
    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    /// The connection this flusher writes through.
    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    /// Run one flush cycle now.
    pub fn flush(&mut self) -> FlushStats {
        self.cycle(None)
    }

    fn cycle(&mut self, deadline: Option<Instant>) -> FlushStats {
        let mut stats = FlushStats::default();
        self.connection.check_idle();

        // Only what was queued at the start of the cycle is drained, so a
        // fast producer cannot hold the flusher in one cycle forever.
        let mut budget = self.queue.len();
        while budget > 0 {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                break;
            }
            let stream = match self.connection.acquire() {
                Acquire::Ready(stream) => stream,
                Acquire::NotReady => {
                    stats.deferred += budget;
                    break;
                }
            };
            let max = if budget < self.chunk_size {
                budget
            } else {
                self.chunk_size
            };
            let batch = self.queue.dequeue_batch(max);
            if batch.is_empty() {
                break;
            }
            budget = budget.saturating_sub(batch.len());

            self.buffer.clear();
            let mut sendable = Vec::with_capacity(batch.len());
            for sample in batch {
                if graphite::encode_into(&sample, &mut self.buffer) {
                    sendable.push(sample);
                } else {
                    stats.skipped += 1;
                }
            }
            if sendable.is_empty() {
                continue;
            }

            let res = stream
                .write_all(self.buffer.as_bytes())
                .and_then(|_| stream.flush());
            match res {
                Ok(()) => {
                    self.connection.wrote();
                    stats.batches += 1;
                    stats.delivered += sendable.len();
                }
                Err(e) => {
                    self.connection.write_failed(&e);
                    self.queue.requeue_front(sendable);
                    stats.write_failures += 1;
                    break;
                }
            }
        }

        let dropped = self.queue.stats().dropped;
        if dropped > self.last_dropped {
            warn!(
                "graphite queue full ({} samples), dropped {} samples since last flush",
                self.queue.capacity(),
                dropped - self.last_dropped
            );
            self.last_dropped = dropped;
        }
        if stats != FlushStats::default() {
            debug!("flushed to graphite: {:?}", stats);
        }
        self.stats += stats;
        stats
    }

    /// Stop the queue, make one final bounded attempt to deliver what is left
    /// and close the connection. Returns the cumulative counts.
    ///
    /// Gives up after the socket timeout, counting the connect attempt and
    /// any write in flight; anything still queued then is lost and logged.
    pub fn shutdown(mut self) -> FlushStats {
        self.queue.close();
        self.connection.expedite();
        let deadline = Instant::now() + self.final_flush_timeout;
        self.connection.set_deadline(deadline);
        let _ = self.cycle(Some(deadline));
        let left = self.queue.len();
        if left > 0 {
            warn!("shutting down with {} undelivered graphite samples", left);
        }
        self.connection.close();
        info!("graphite flusher stopped: {:?}", self.stats);
        self.stats
    }

    /// Tick every flush interval until `shutdown` receives or hangs up, then
    /// shut down.
    pub fn run(mut self, shutdown: mpsc::Receiver<()>) -> FlushStats {
        loop {
            match shutdown.recv_timeout(self.flush_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let _ = self.flush();
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return self.shutdown();
                }
            }
        }
    }
}

impl<C> Flusher<C>
where
    C: Connector + Send + 'static,
    C::Stream: Send + 'static,
{
    /// Run the flusher on its own thread.
    pub fn spawn(self) -> io::Result<FlusherHandle> {
        let (snd, rcv) = mpsc::channel();
        let join = thread::Builder::new()
            .name("graphite-flusher".to_string())
            .spawn(move || self.run(rcv))?;
        Ok(FlusherHandle {
            shutdown: snd,
            join: join,
        })
    }
}

/// Handle to a flusher running on its own thread.
pub struct FlusherHandle {
    shutdown: mpsc::Sender<()>,
    join: thread::JoinHandle<FlushStats>,
}

impl FlusherHandle {
    /// Stop the flusher, waiting for its final flush. Returns its cumulative
    /// counts.
    pub fn shutdown(self) -> FlushStats {
        let _ = self.shutdown.send(());
        match self.join.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!("graphite flusher thread panicked");
                FlushStats::default()
            }
        }
    }
}
