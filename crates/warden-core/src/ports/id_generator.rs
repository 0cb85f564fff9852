//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Job / Group 用の ULID（時刻でソート可能、調整なしで分散生成可能）
//! - **TransactionIdGenerator**: TransactionId 用の単調増加 surrogate

use std::sync::Mutex;
use std::time::SystemTime;

use crate::domain::ids::{GroupId, JobId, TransactionId};
use crate::ports::Clock;
use ulid::{Generator, Ulid};

/// Job / Group の ID 発行
pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;

    fn generate_group_id(&self) -> GroupId;
}

/// Clock を使って現在時刻ベースの ULID を生成する。
///
/// 同じ millis 内では単調増加（`ulid::Generator`）なので、生成順 = ソート順。
pub struct UlidGenerator<C> {
    clock: C,
    generator: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            generator: Mutex::new(Generator::new()),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let now = SystemTime::from(self.clock.now());
        let mut generator = self.generator.lock().unwrap_or_else(|e| e.into_inner());
        // Overflow of the random part within one millisecond: fall back to a fresh ULID.
        generator
            .generate_from_datetime(now)
            .unwrap_or_else(|_| Ulid::from_datetime(now))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next_ulid())
    }

    fn generate_group_id(&self) -> GroupId {
        GroupId::from(self.next_ulid())
    }
}

/// Hands out strictly increasing `TransactionId`s derived from the clock.
///
/// Within one millisecond the sequence part increments; if the clock stalls
/// or steps backwards the generator keeps counting from the last id, so ids
/// never repeat and never decrease.
pub struct TransactionIdGenerator<C> {
    clock: C,
    last: Mutex<TransactionId>,
}

impl<C: Clock> TransactionIdGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last: Mutex::new(TransactionId::MIN),
        }
    }

    pub fn next_id(&self) -> TransactionId {
        let candidate = TransactionId::from_parts(self.clock.now().timestamp_millis(), 0);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = if candidate > *last {
            candidate
        } else {
            TransactionId::new(last.value() + 1)
        };
        *last = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_job_id();
        let id2 = id_gen.generate_job_id();
        assert_ne!(id1, id2);
        assert!(id_gen.generate_group_id().to_string().starts_with("group-"));
    }

    #[test]
    fn ulid_generator_is_monotonic_under_a_stalled_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let ids: Vec<JobId> = (0..32).map(|_| id_gen.generate_job_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ulid_generator_with_fixed_clock_uses_clock_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id = id_gen.generate_job_id();
        let timestamp = (id.as_ulid().0 >> 80) as u64;
        assert_eq!(timestamp, fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn transaction_ids_increase_within_one_millisecond() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let id_gen = TransactionIdGenerator::new(clock.clone());

        let a = id_gen.next_id();
        let b = id_gen.next_id();
        assert!(b > a);
        assert_eq!(a.timestamp_millis(), b.timestamp_millis());
        assert_eq!(b.sequence(), 1);
    }

    #[test]
    fn transaction_ids_survive_clock_stepping_back() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap());
        let id_gen = TransactionIdGenerator::new(clock.clone());

        let a = id_gen.next_id();
        clock.advance(chrono::Duration::seconds(-5));
        let b = id_gen.next_id();
        assert!(b > a);
    }
}
