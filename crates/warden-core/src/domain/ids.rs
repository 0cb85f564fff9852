//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + Phantom type
//! Job / Group は ULID を使う。`Id<T>` で共通実装を提供し、`T` はコンパイル時の
//! 区別だけに使うマーカー型（PhantomData）。
//!
//! # TransactionId
//! トランザクションは論理時計として使うので ULID ではなく、時刻から導出した
//! 単調増加の `i64` surrogate を使う（上位: epoch millis、下位 16 bit: 同一 millis 内の連番）。
//! 大きい id ほど後に開始したトランザクション。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "job-", "group-"）
    fn prefix() -> &'static str;
}

/// 型付き ULID。`T` が違えば別の型になるので、JobId と GroupId を取り違えない
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {}

impl IdMarker for Group {
    fn prefix() -> &'static str {
        "group-"
    }
}

/// キュー上のジョブ 1 行の ID
pub type JobId = Id<Job>;

/// ジョブグループ（coordinator 1 つとその fan-out unit 群）の ID
pub type GroupId = Id<Group>;

/// Time-ordered surrogate id of a write transaction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransactionId(i64);

impl TransactionId {
    /// Bits reserved for the per-millisecond sequence.
    pub const SEQUENCE_BITS: u32 = 16;

    /// Far-past sentinel; every real transaction id is greater.
    pub const MIN: TransactionId = TransactionId(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// 上位ビットに epoch millis、下位 [`Self::SEQUENCE_BITS`] ビットに連番を詰める
    pub fn from_parts(timestamp_ms: i64, sequence: u16) -> Self {
        Self((timestamp_ms << Self::SEQUENCE_BITS) | i64::from(sequence))
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn timestamp_millis(self) -> i64 {
        self.0 >> Self::SEQUENCE_BITS
    }

    pub fn sequence(self) -> u16 {
        (self.0 & ((1 << Self::SEQUENCE_BITS) - 1)) as u16
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}
