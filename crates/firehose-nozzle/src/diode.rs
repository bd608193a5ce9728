// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free single-producer/single-consumer ring buffer that never blocks its writer.
//!
//! The writer stores into slot `write mod N` and then publishes `write + 1`. When the writer laps
//! the reader, the oldest unread values are overwritten; the reader notices the gap on its next
//! read, skips ahead to the oldest value still present, and reports the number of lost values to
//! the [`Alerter`]. Losses are therefore reported once, by the reader, and the cumulative value
//! reported always equals the number of values that were written but never returned.
//!
//! Every slot holds an owned, heap-allocated bucket. Both sides exchange buckets with an atomic
//! `swap`, so a bucket is owned by exactly one side at any time.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::time::Duration;

/// Poll interval used by [`Diode::next`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Receives the number of values lost each time the reader detects an overflow.
pub trait Alerter: Send + Sync {
    fn alert(&self, missed: u64);
}

impl<F> Alerter for F
where
    F: Fn(u64) + Send + Sync,
{
    fn alert(&self, missed: u64) {
        self(missed);
    }
}

struct Bucket<T> {
    seq: u64,
    data: T,
}

pub struct Diode<T> {
    slots: Box<[AtomicPtr<Bucket<T>>]>,
    mask: u64,
    write_index: AtomicU64,
    read_index: AtomicU64,
    missed: AtomicU64,
    alerter: Box<dyn Alerter>,
    _marker: PhantomData<*mut T>,
}

// SAFETY: values of `T` only ever move between threads (never shared by reference), and every
// bucket pointer is exchanged with an atomic swap so it has exactly one owner.
unsafe impl<T: Send> Send for Diode<T> {}
// SAFETY: see above; `&Diode<T>` only allows moving `T` in and out.
unsafe impl<T: Send> Sync for Diode<T> {}

impl<T> std::fmt::Debug for Diode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diode")
            .field("capacity", &self.capacity())
            .field("write_index", &self.write_index.load(Ordering::Relaxed))
            .field("read_index", &self.read_index.load(Ordering::Relaxed))
            .field("missed", &self.missed())
            .finish()
    }
}

/// Largest number of slots a diode will allocate.
pub const MAX_CAPACITY: usize = 1 << 24;

/// `size` rounded up to a power of two, within `1..=MAX_CAPACITY`.
#[must_use]
pub fn rounded_capacity(size: usize) -> usize {
    size.clamp(1, MAX_CAPACITY)
        .checked_next_power_of_two()
        .unwrap_or(MAX_CAPACITY)
}

impl<T> Diode<T> {
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total number of values lost to overflow so far.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    /// Number of values written but not yet read, capped at the capacity.
    #[must_use]
    pub fn len(&self) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        let pending = write.saturating_sub(read).min(self.mask + 1);
        usize::try_from(pending).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, index: u64) -> &AtomicPtr<Bucket<T>> {
        // mask < slots.len(), so the masked index is always in bounds
        &self.slots[(index & self.mask) as usize]
    }
}

impl<T: Send> Diode<T> {
    /// Creates a diode holding at least `size` values. The capacity is rounded up to a power of
    /// two, minimum 1 and maximum [`MAX_CAPACITY`].
    pub fn new(size: usize, alerter: impl Alerter + 'static) -> Self {
        let capacity = rounded_capacity(size);
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Diode {
            slots,
            mask: capacity as u64 - 1,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            alerter: Box::new(alerter),
            _marker: PhantomData,
        }
    }

    /// Stores `data`, overwriting the oldest unread value when full. Never blocks.
    ///
    /// Must only be called from a single writer at a time.
    pub fn set(&self, data: T) {
        let seq = self.write_index.load(Ordering::Relaxed);
        let bucket = Box::into_raw(Box::new(Bucket { seq, data }));
        let previous = self.slot(seq).swap(bucket, Ordering::AcqRel);
        if !previous.is_null() {
            // SAFETY: the pointer came from `Box::into_raw` and the swap made us its only owner.
            drop(unsafe { Box::from_raw(previous) });
        }
        self.write_index.store(seq + 1, Ordering::Release);
    }

    /// Returns the next value, or `None` when nothing is available. Never blocks.
    ///
    /// Must only be called from a single reader at a time.
    pub fn try_next(&self) -> Option<T> {
        loop {
            let read = self.read_index.load(Ordering::Acquire);
            let write = self.write_index.load(Ordering::Acquire);
            if read >= write {
                return None;
            }

            let capacity = self.mask + 1;
            let next = if write - read > capacity {
                write - capacity
            } else {
                read
            };

            let taken = self.slot(next).swap(ptr::null_mut(), Ordering::AcqRel);
            if taken.is_null() {
                return None;
            }
            // SAFETY: the pointer came from `Box::into_raw` and the swap made us its only owner.
            let bucket = unsafe { Box::from_raw(taken) };
            if bucket.seq < next {
                // left over from a lap that has already been accounted for
                continue;
            }

            self.read_index.store(bucket.seq + 1, Ordering::Release);
            let dropped = bucket.seq - read;
            if dropped > 0 {
                self.missed.fetch_add(dropped, Ordering::Relaxed);
                self.alerter.alert(dropped);
            }
            return Some(bucket.data);
        }
    }

    /// Waits until a value is available, polling every [`DEFAULT_POLL_INTERVAL`].
    pub async fn next(&self) -> T {
        self.next_with_interval(DEFAULT_POLL_INTERVAL).await
    }

    pub async fn next_with_interval(&self, poll_interval: Duration) -> T {
        loop {
            if let Some(data) = self.try_next() {
                return data;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl<T> Drop for Diode<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let taken = slot.swap(ptr::null_mut(), Ordering::Acquire);
            if !taken.is_null() {
                // SAFETY: we have exclusive access and the pointer came from `Box::into_raw`.
                drop(unsafe { Box::from_raw(taken) });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn counting_diode(size: usize) -> (Diode<u64>, Arc<AtomicU64>) {
        let reported = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&reported);
        let diode = Diode::new(size, move |missed: u64| {
            sink.fetch_add(missed, Ordering::SeqCst);
        });
        (diode, reported)
    }

    fn drain(diode: &Diode<u64>) -> Vec<u64> {
        std::iter::from_fn(|| diode.try_next()).collect()
    }

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        let (diode, _) = counting_diode(10);
        assert_eq!(diode.capacity(), 16);
        let (diode, _) = counting_diode(0);
        assert_eq!(diode.capacity(), 1);
        let (diode, _) = counting_diode(8);
        assert_eq!(diode.capacity(), 8);
    }

    #[test]
    fn test_capacity_is_bounded() {
        assert_eq!(rounded_capacity(MAX_CAPACITY), MAX_CAPACITY);
        assert_eq!(rounded_capacity(MAX_CAPACITY + 1), MAX_CAPACITY);
        assert_eq!(rounded_capacity(usize::MAX / 2 + 2), MAX_CAPACITY);
        assert_eq!(rounded_capacity(usize::MAX), MAX_CAPACITY);
    }

    #[test]
    fn test_debug_reports_capacity_and_losses() {
        let (diode, _) = counting_diode(2);
        for i in 0..5 {
            diode.set(i);
        }
        diode.try_next();
        let debug = format!("{diode:?}");
        assert!(debug.contains("capacity: 2"), "{debug}");
        assert!(debug.contains("missed: 3"), "{debug}");
    }

    #[test]
    fn test_empty_diode_returns_none() {
        let (diode, reported) = counting_diode(4);
        assert!(diode.try_next().is_none());
        assert!(diode.is_empty());
        assert_eq!(reported.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fifo_within_capacity() {
        let (diode, reported) = counting_diode(8);
        for i in 0..8 {
            diode.set(i);
        }
        assert_eq!(diode.len(), 8);
        assert_eq!(drain(&diode), (0..8).collect::<Vec<_>>());
        assert_eq!(reported.load(Ordering::SeqCst), 0);
        assert_eq!(diode.missed(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest_and_alerts() {
        let (diode, reported) = counting_diode(4);
        for i in 0..10 {
            diode.set(i);
        }
        assert_eq!(drain(&diode), vec![6, 7, 8, 9]);
        assert_eq!(reported.load(Ordering::SeqCst), 6);
        assert_eq!(diode.missed(), 6);
    }

    #[test]
    fn test_interleaved_reads_and_writes_keep_order() {
        let (diode, reported) = counting_diode(4);
        diode.set(1);
        diode.set(2);
        assert_eq!(diode.try_next(), Some(1));
        diode.set(3);
        diode.set(4);
        diode.set(5);
        assert_eq!(drain(&diode), vec![2, 3, 4, 5]);
        assert_eq!(reported.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_overflow_after_partial_read() {
        let (diode, reported) = counting_diode(2);
        diode.set(0);
        assert_eq!(diode.try_next(), Some(0));
        for i in 1..6 {
            diode.set(i);
        }
        assert_eq!(drain(&diode), vec![4, 5]);
        assert_eq!(reported.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_releases_unread_values() {
        let marker = Arc::new(());
        {
            let diode = Diode::new(4, |_missed: u64| {});
            for _ in 0..6 {
                diode.set(Arc::clone(&marker));
            }
            assert_eq!(Arc::strong_count(&marker), 5);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_concurrent_writer_and_reader_preserve_order_and_accounting() {
        let reported = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&reported);
        let diode = Arc::new(Diode::new(64, move |missed: u64| {
            sink.fetch_add(missed, Ordering::SeqCst);
        }));
        const TOTAL: u64 = 100_000;

        let writer = {
            let diode = Arc::clone(&diode);
            std::thread::spawn(move || {
                for i in 0..TOTAL {
                    diode.set(i);
                }
            })
        };

        let mut received = Vec::new();
        loop {
            match diode.try_next() {
                Some(value) => received.push(value),
                None if writer.is_finished() && diode.is_empty() => break,
                None => std::thread::yield_now(),
            }
        }
        writer.join().unwrap();
        received.extend(std::iter::from_fn(|| diode.try_next()));

        assert!(received.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(
            received.len() as u64 + reported.load(Ordering::SeqCst),
            TOTAL
        );
        assert_eq!(received.last().copied(), Some(TOTAL - 1));
    }

    #[tokio::test]
    async fn test_next_waits_for_a_value() {
        let diode = Arc::new(Diode::new(4, |_missed: u64| {}));
        let writer = Arc::clone(&diode);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set(7_u64);
        });
        let value = tokio::time::timeout(
            Duration::from_secs(2),
            diode.next_with_interval(Duration::from_millis(1)),
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    proptest! {
        #[test]
        fn prop_fifo_when_within_capacity(values in proptest::collection::vec(any::<u64>(), 0..64)) {
            let (diode, reported) = counting_diode(64);
            for v in &values {
                diode.set(*v);
            }
            prop_assert_eq!(drain(&diode), values);
            prop_assert_eq!(reported.load(Ordering::SeqCst), 0);
        }

        #[test]
        fn prop_overflow_loses_exactly_the_oldest(size_exp in 0u32..6, extra in 0usize..200) {
            let capacity = 1usize << size_exp;
            let total = capacity + extra;
            let (diode, reported) = counting_diode(capacity);
            for v in 0..total as u64 {
                diode.set(v);
            }
            let expected: Vec<u64> = (extra as u64..total as u64).collect();
            prop_assert_eq!(drain(&diode), expected);
            prop_assert_eq!(reported.load(Ordering::SeqCst), extra as u64);
        }
    }
}
