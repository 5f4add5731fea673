//! Bounded sample queues shared between caller threads and the acquisition
//! thread.
//!
//! Storage is a `ringbuf` ring split into its two halves, each behind its own
//! lock so a producer and a consumer never contend with each other. Waiting
//! is done on a pair of one-slot crossbeam channels used as wakeup flags.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use ringbuf::{Consumer, Producer, RingBuffer};

/// Locks a mutex, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SampleQueue<T> {
    producer: Mutex<Producer<T>>,
    consumer: Mutex<Consumer<T>>,
    capacity: usize,
    data_tx: Sender<()>,
    data_rx: Receiver<()>,
    space_tx: Sender<()>,
    space_rx: Receiver<()>,
}

impl<T: Copy> SampleQueue<T> {
    pub fn new(capacity: usize) -> SampleQueue<T> {
        let (producer, consumer) = RingBuffer::new(capacity).split();
        let (data_tx, data_rx) = bounded(1);
        let (space_tx, space_rx) = bounded(1);
        SampleQueue {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            capacity,
            data_tx,
            data_rx,
            space_tx,
            space_rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.consumer).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        lock(&self.producer).remaining()
    }

    /// Pushes as much of `values` as fits and returns how many went in.
    pub fn push_slice(&self, values: &[T]) -> usize {
        let n = lock(&self.producer).push_slice(values);
        if n > 0 {
            let _ = self.data_tx.try_send(());
        }
        n
    }

    /// Pushes all of `values`, discarding the oldest queued entries to make
    /// room. Returns how many entries were thrown away.
    pub fn force_push(&self, values: &[T]) -> usize {
        let values = if values.len() > self.capacity {
            &values[values.len() - self.capacity..]
        } else {
            values
        };
        let mut dropped = 0;
        let free = self.remaining();
        if free < values.len() {
            dropped = lock(&self.consumer).discard(values.len() - free);
        }
        self.push_slice(values);
        dropped
    }

    /// Pops up to `out.len()` entries, oldest first.
    pub fn pop_into(&self, out: &mut [T]) -> usize {
        let n = lock(&self.consumer).pop_slice(out);
        if n > 0 {
            let _ = self.space_tx.try_send(());
        }
        n
    }

    pub fn clear(&self) -> usize {
        let n = self.len();
        self.skip(n)
    }

    /// Drops up to `n` of the oldest entries and returns how many went.
    pub fn skip(&self, n: usize) -> usize {
        let n = lock(&self.consumer).discard(n);
        if n > 0 {
            let _ = self.space_tx.try_send(());
        }
        n
    }

    /// Sleeps until data was pushed, someone called [`notify`], or `timeout`
    /// elapsed. Wakeups can be spurious; callers re-check their condition.
    ///
    /// [`notify`]: SampleQueue::notify
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        self.data_rx.recv_timeout(timeout).is_ok()
    }

    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        self.space_rx.recv_timeout(timeout).is_ok()
    }

    /// Wakes every waiter so it can re-check cancellation or detach state.
    pub fn notify(&self) {
        let _ = self.data_tx.try_send(());
        let _ = self.space_tx.try_send(());
    }
}

/// A buffer written with the cyclic flag, replayed until replaced.
#[derive(Debug)]
struct CyclicBuffer {
    values: Vec<f32>,
    pos: usize,
}

/// Outcome of filling one chunk of output values.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Fill {
    /// Values taken from written data, queued or cyclic.
    pub written: usize,
    /// Values for which nothing had ever been written; they were zeroed.
    pub starved: usize,
}

/// Output values waiting to be sent on one channel.
pub struct OutputQueue {
    queue: SampleQueue<f32>,
    cyclic: Mutex<Option<CyclicBuffer>>,
    hold: Mutex<Option<f32>>,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> OutputQueue {
        OutputQueue {
            queue: SampleQueue::new(capacity),
            cyclic: Mutex::new(None),
            hold: Mutex::new(None),
        }
    }

    /// Values queued and not yet sent. A cyclic buffer never runs dry and
    /// is reported by [`is_cyclic`](OutputQueue::is_cyclic) instead.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_cyclic(&self) -> bool {
        lock(&self.cyclic).is_some()
    }

    /// The value repeated once queued data runs out.
    pub fn hold_value(&self) -> Option<f32> {
        *lock(&self.hold)
    }

    /// Queues `values`. A cyclic write replaces whatever was queued before
    /// and replays forever; a plain write stops any cyclic replay first.
    ///
    /// With `wait` set the call sleeps up to `timeout` for space, otherwise
    /// values that don't fit are refused. Either way nothing is queued
    /// unless all of `values` fit.
    pub fn write(&self, values: &[f32], cyclic: bool, wait: bool, timeout: Duration) -> Result<(), usize> {
        if cyclic {
            self.queue.clear();
            let mut buf = lock(&self.cyclic);
            *buf = if values.is_empty() {
                None
            } else {
                Some(CyclicBuffer {
                    values: values.to_vec(),
                    pos: 0,
                })
            };
            return Ok(());
        }

        if lock(&self.cyclic).take().is_some() {
            self.queue.clear();
        }
        if values.len() > self.queue.capacity() {
            return Err(self.queue.remaining());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let free = self.queue.remaining();
            if free >= values.len() {
                break;
            }
            let now = Instant::now();
            if !wait || now >= deadline {
                return Err(free);
            }
            self.queue.wait_for_space(deadline - now);
        }
        self.queue.push_slice(values);
        Ok(())
    }

    /// Fills `out` with the next values to send. Once written data runs out
    /// the last value sent is repeated.
    pub fn fill(&self, out: &mut [f32]) -> Fill {
        let mut fill = Fill::default();
        {
            let mut cyclic = lock(&self.cyclic);
            if let Some(buf) = cyclic.as_mut() {
                for v in out.iter_mut() {
                    *v = buf.values[buf.pos];
                    buf.pos = (buf.pos + 1) % buf.values.len();
                }
                *lock(&self.hold) = out.last().copied();
                fill.written = out.len();
                return fill;
            }
        }

        let n = self.queue.pop_into(out);
        fill.written = n;
        let mut hold = lock(&self.hold);
        if n > 0 {
            *hold = Some(out[n - 1]);
        }
        match *hold {
            Some(v) => out[n..].iter_mut().for_each(|x| *x = v),
            None => {
                out[n..].iter_mut().for_each(|x| *x = 0.0);
                fill.starved = out.len() - n;
            }
        }
        fill
    }

    /// Drops queued values and stops cyclic replay. The hold value stays.
    pub fn flush(&self) {
        lock(&self.cyclic).take();
        self.queue.clear();
    }

    /// Like [`flush`](OutputQueue::flush), but also forgets the hold value.
    pub fn reset(&self) {
        self.flush();
        lock(&self.hold).take();
    }

    pub fn notify(&self) {
        self.queue.notify();
    }
}
