//! Time-ordered 64-bit message identifiers.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! | 0 | 41 bits: ms since EPOCH | 10 bits: partition | 12 bits: sequence |
//! ```
//!
//! Each generator instance owns one partition. Ids from a single instance
//! never repeat and never decrease; ids from instances with distinct
//! partitions never collide.

use std::sync::Mutex;

use crate::error::Error;

/// 2024-01-01T00:00:00Z in milliseconds since the Unix epoch.
pub const EPOCH: u64 = 1_704_067_200_000;

const PARTITION_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_PARTITION: u16 = (1 << PARTITION_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

const TIMESTAMP_SHIFT: u32 = PARTITION_BITS + SEQUENCE_BITS;
const PARTITION_SHIFT: u32 = SEQUENCE_BITS;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

#[derive(Debug)]
struct State {
    last_ms: u64,
    sequence: u64,
    fenced: bool,
}

/// Snowflake-style id generator.
pub struct IdGenerator<C = SystemClock> {
    partition: u16,
    clock: C,
    state: Mutex<State>,
}

impl IdGenerator<SystemClock> {
    pub fn new(partition: u16) -> Result<Self, Error> {
        Self::with_clock(partition, SystemClock)
    }

    /// Partition derived from the current process id.
    pub fn for_process() -> Self {
        let partition = (std::process::id() % (MAX_PARTITION as u32 + 1)) as u16;
        Self::unchecked(partition, SystemClock)
    }
}

impl<C: Clock> IdGenerator<C> {
    pub fn with_clock(partition: u16, clock: C) -> Result<Self, Error> {
        if partition > MAX_PARTITION {
            return Err(Error::invalid_parameter(format!(
                "partition {partition} exceeds {MAX_PARTITION}"
            )));
        }

        Ok(Self::unchecked(partition, clock))
    }

    fn unchecked(partition: u16, clock: C) -> Self {
        Self {
            partition,
            clock,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
                fenced: false,
            }),
        }
    }

    pub fn partition(&self) -> u16 {
        self.partition
    }

    /// Returns the next id.
    ///
    /// Once the clock has been seen moving backwards the generator is fenced
    /// and every later call fails with [`Error::ClockRegression`].
    pub fn next(&self) -> Result<u64, Error> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut now = self.clock.now_ms();

        if state.fenced || now < state.last_ms {
            state.fenced = true;
            tracing::error!(
                partition = self.partition,
                last = state.last_ms,
                now,
                "clock regression, id generator fenced"
            );
            return Err(Error::ClockRegression {
                last: state.last_ms,
                now,
            });
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence space for this millisecond is used up.
                while now == state.last_ms {
                    std::hint::spin_loop();
                    now = self.clock.now_ms();
                }
                if now < state.last_ms {
                    state.fenced = true;
                    return Err(Error::ClockRegression {
                        last: state.last_ms,
                        now,
                    });
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;

        Ok(compose(now, self.partition, state.sequence))
    }
}

fn compose(now_ms: u64, partition: u16, sequence: u64) -> u64 {
    (now_ms.saturating_sub(EPOCH) << TIMESTAMP_SHIFT)
        | ((partition as u64) << PARTITION_SHIFT)
        | sequence
}

/// The parts an id was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    pub timestamp_ms: u64,
    pub partition: u16,
    pub sequence: u16,
}

pub fn decompose(id: u64) -> IdParts {
    IdParts {
        timestamp_ms: (id >> TIMESTAMP_SHIFT) + EPOCH,
        partition: ((id >> PARTITION_SHIFT) & MAX_PARTITION as u64) as u16,
        sequence: (id & MAX_SEQUENCE) as u16,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    };

    use super::*;

    /// Clock driven by the test. Each reading can optionally advance it.
    #[derive(Clone, Default)]
    struct ManualClock {
        now: Arc<AtomicU64>,
        step_every: Option<u64>,
        reads: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn at(ms: u64) -> Self {
            Self {
                now: Arc::new(AtomicU64::new(ms)),
                ..Default::default()
            }
        }

        fn set(&self, ms: u64) {
            self.now.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            let reads = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(every) = self.step_every {
                if reads % every == 0 {
                    return self.now.fetch_add(1, Ordering::SeqCst) + 1;
                }
            }
            self.now.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn ids_decompose_into_their_parts() {
        let clock = ManualClock::at(EPOCH + 1234);
        let ids = IdGenerator::with_clock(42, clock).unwrap();

        let first = ids.next().unwrap();
        let second = ids.next().unwrap();

        assert_eq!(
            decompose(first),
            IdParts {
                timestamp_ms: EPOCH + 1234,
                partition: 42,
                sequence: 0
            }
        );
        assert_eq!(decompose(second).sequence, 1);
        assert!(second > first);
    }

    #[test]
    fn rejects_out_of_range_partition() {
        assert!(IdGenerator::new(MAX_PARTITION + 1).is_err());
        assert!(IdGenerator::new(MAX_PARTITION).is_ok());
    }

    #[test]
    fn sequence_exhaustion_waits_for_next_millisecond() {
        let clock = ManualClock {
            now: Arc::new(AtomicU64::new(EPOCH + 10)),
            // Only every 5000th reading moves time forward, so the sequence
            // wraps inside a single millisecond.
            step_every: Some(5000),
            reads: Arc::new(AtomicU64::new(0)),
        };
        let ids = IdGenerator::with_clock(1, clock).unwrap();

        let mut last = 0;
        for _ in 0..(MAX_SEQUENCE as usize + 10) {
            let id = ids.next().unwrap();
            assert!(id > last);
            last = id;
        }

        assert!(decompose(last).timestamp_ms > EPOCH + 10);
    }

    #[test]
    fn clock_regression_fences_the_generator() {
        let clock = ManualClock::at(EPOCH + 100);
        let ids = IdGenerator::with_clock(3, clock.clone()).unwrap();

        ids.next().unwrap();
        clock.set(EPOCH + 99);

        assert!(matches!(
            ids.next(),
            Err(Error::ClockRegression { last, now }) if last == EPOCH + 100 && now == EPOCH + 99
        ));

        clock.set(EPOCH + 500);
        assert!(matches!(ids.next(), Err(Error::ClockRegression { .. })));
    }

    #[test]
    fn concurrent_callers_get_unique_increasing_ids() {
        let ids = Arc::new(IdGenerator::new(7).unwrap());

        let handles = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || {
                    (0..2000)
                        .map(|_| ids.next().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for handle in handles {
            let local = handle.join().unwrap();
            assert!(local.windows(2).all(|w| w[0] < w[1]));
            for id in local {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 16_000);
    }
}
