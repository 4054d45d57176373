/*
 * Copyright (c) 2022 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Error;
use crate::counter as stats;

const SEND_BATCH: usize = 1024;

pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    let shared = Arc::new(OverwriteQueue::with_capacity(size));
    (
        Sender {
            queue: shared.clone(),
        },
        Receiver {
            queue: shared.clone(),
        },
        StatsHandle { queue: shared },
    )
}

#[derive(Debug, Default)]
pub struct Counter {
    pub input: AtomicU64,
    pub output: AtomicU64,
    pub overwritten: AtomicU64,
}

// fixed size MPSC queue, the oldest messages are dropped when full
struct OverwriteQueue<T> {
    size: usize,
    buffer: Mutex<VecDeque<T>>,
    notify: Condvar,

    senders: AtomicUsize,
    terminated: AtomicBool,

    counter: Counter,
}

impl<T> OverwriteQueue<T> {
    fn with_capacity(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            size,
            buffer: Mutex::new(VecDeque::with_capacity(size)),
            notify: Condvar::new(),
            senders: AtomicUsize::new(1),
            terminated: AtomicBool::new(false),
            counter: Counter::default(),
        }
    }

    fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    // caller checks termination and batch size
    fn push_batch<I: ExactSizeIterator<Item = T>>(&self, msgs: I) {
        let count = msgs.len();
        let mut buffer = self.buffer.lock();
        let overflow = (buffer.len() + count).saturating_sub(self.size);
        if overflow > 0 {
            buffer.drain(..overflow);
            self.counter
                .overwritten
                .fetch_add(overflow as u64, Ordering::Relaxed);
        }
        buffer.extend(msgs);
        self.counter
            .input
            .fetch_add(count as u64, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn recv_into(
        &self,
        timeout: Option<Duration>,
        max: usize,
        out: &mut Vec<T>,
    ) -> Result<usize, Error<T>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut buffer = self.buffer.lock();
        while buffer.is_empty() {
            if self.terminated() {
                return Err(Error::Terminated(None, None));
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.notify.wait_for(&mut buffer, deadline - now);
                }
                None => self.notify.wait(&mut buffer),
            }
        }
        let count = buffer.len().min(max.max(1));
        out.extend(buffer.drain(..count));
        self.counter
            .output
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    fn close(&self) {
        let _buffer = self.buffer.lock();
        self.terminated.store(true, Ordering::Release);
        self.notify.notify_all();
    }

    fn pending(&self) -> usize {
        self.buffer.lock().len()
    }
}

pub struct Sender<T> {
    queue: Arc<OverwriteQueue<T>>,
}

impl<T> Sender<T> {
    pub fn terminated(&self) -> bool {
        self.queue.terminated()
    }

    pub fn capacity(&self) -> usize {
        self.queue.size
    }

    // messages waiting for the receiver
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        if self.queue.terminated() {
            return Err(Error::Terminated(Some(msg), None));
        }
        self.queue.push_batch(std::iter::once(msg));
        Ok(())
    }

    // This method clears the Vec on success, and leave it as it is on failure
    pub fn send_all(&self, msgs: &mut Vec<T>) -> Result<(), Error<T>> {
        if self.queue.terminated() {
            return Err(Error::Terminated(None, None));
        }
        if msgs.len() > self.queue.size {
            return Err(Error::BatchTooLarge(None));
        }
        self.queue.push_batch(msgs.drain(..));
        Ok(())
    }

    pub fn send_large(&self, mut msgs: Vec<T>) -> Result<(), Error<T>> {
        let batch = SEND_BATCH.min(self.queue.size);
        while !msgs.is_empty() {
            if self.queue.terminated() {
                return Err(Error::Terminated(None, Some(msgs)));
            }
            let n = batch.min(msgs.len());
            self.queue.push_batch(msgs.drain(..n));
        }
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.queue.senders.fetch_add(1, Ordering::Relaxed);
        Sender {
            queue: self.queue.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // last sender to drop
        if self.queue.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.close();
        }
    }
}

pub struct Receiver<T> {
    queue: Arc<OverwriteQueue<T>>,
}

impl<T> Receiver<T> {
    pub fn terminated(&self) -> bool {
        self.queue.terminated()
    }

    // rejects further sends, queued messages can still be received
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let mut out = Vec::with_capacity(1);
        self.queue.recv_into(timeout, 1, &mut out)?;
        out.pop().ok_or(Error::Timeout)
    }

    pub fn recv_n(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<T>, Error<T>> {
        let mut msgs = Vec::with_capacity(n);
        self.queue.recv_into(timeout, n, &mut msgs)?;
        Ok(msgs)
    }

    // Clears anything in msgs, and receive at most msgs.capacity() messages
    pub fn recv_all(&self, msgs: &mut Vec<T>, timeout: Option<Duration>) -> Result<(), Error<T>> {
        msgs.clear();
        let max = msgs.capacity();
        self.queue.recv_into(timeout, max, msgs).map(|_| ())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl<T> Iterator for Receiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv(None).ok()
    }
}

pub struct StatsHandle<T> {
    queue: Arc<OverwriteQueue<T>>,
}

impl<T: Send> stats::OwnedCountable for StatsHandle<T> {
    fn get_counters(&self) -> Vec<stats::Counter> {
        let counter = &self.queue.counter;
        vec![
            (
                "in",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(counter.input.swap(0, Ordering::Relaxed)),
            ),
            (
                "out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(counter.output.swap(0, Ordering::Relaxed)),
            ),
            (
                "overwritten",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(counter.overwritten.swap(0, Ordering::Relaxed)),
            ),
            (
                "pending",
                stats::CounterType::Gauged,
                stats::CounterValue::Unsigned(self.queue.pending() as u64),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.queue.terminated()
    }
}
