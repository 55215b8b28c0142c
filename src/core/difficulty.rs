//! Difficulty targets and retargeting
//!
//! Block headers carry the target in Bitcoin's compact "bits" encoding: an
//! 8-bit exponent and a 23-bit mantissa, `target = mantissa * 256^(exp - 3)`.
//! A block hash, read as a big-endian 256-bit integer, must not exceed the
//! expanded target.

use crate::core::blockchain::ConsensusParams;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use std::collections::VecDeque;
use thiserror::Error;

/// Easiest target; roughly every other hash qualifies
pub const REGTEST_BITS: u32 = 0x207f_ffff;

/// Default starting target (about 16 leading zero bits)
pub const DEFAULT_BITS: u32 = 0x1f00_ffff;

const SIGN_BIT: u32 = 0x0080_0000;
const MANTISSA_MASK: u32 = 0x007f_ffff;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DifficultyError {
    #[error("Invalid compact target: {0:#010x}")]
    InvalidCompact(u32),
}

/// Expand compact bits into the numeric target
pub fn expand_compact(bits: u32) -> Result<BigUint, DifficultyError> {
    let exponent = bits >> 24;
    let mantissa = bits & MANTISSA_MASK;
    if bits & SIGN_BIT != 0 || mantissa == 0 {
        return Err(DifficultyError::InvalidCompact(bits));
    }

    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3)) as usize
    };

    if target.is_zero() || target.bits() > 256 {
        return Err(DifficultyError::InvalidCompact(bits));
    }
    Ok(target)
}

/// Encode a target in compact form. Precision beyond the 23-bit mantissa is
/// truncated, so `expand(compress(t)) <= t`.
pub fn compress_target(target: &BigUint) -> u32 {
    let mut size = ((target.bits() + 7) / 8) as u32;
    let mut compact = if size <= 3 {
        target.to_u32().unwrap_or(0) << (8 * (3 - size))
    } else {
        (target.clone() >> (8 * (size - 3)) as usize)
            .to_u32()
            .unwrap_or(0)
    };

    // Keep the mantissa positive
    if compact & SIGN_BIT != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Whether a hex block hash satisfies `bits`
pub fn hash_meets_target(hash_hex: &str, bits: u32) -> bool {
    let Ok(target) = expand_compact(bits) else {
        return false;
    };
    match hex::decode(hash_hex) {
        Ok(bytes) if bytes.len() == 32 => BigUint::from_bytes_be(&bytes) <= target,
        _ => false,
    }
}

/// Expected number of hashes to meet `bits`: `2^256 / (target + 1)`
pub fn block_work(bits: u32) -> BigUint {
    match expand_compact(bits) {
        Ok(target) => (BigUint::one() << 256usize) / (target + BigUint::one()),
        Err(_) => BigUint::zero(),
    }
}

/// Scale `old_bits` by `actual / expected`, clamping the ratio to
/// `[1/max_factor, max_factor]` and the result to the proof-of-work limit.
pub fn retarget(
    old_bits: u32,
    actual_secs: i64,
    expected_secs: i64,
    max_factor: u32,
    pow_limit_bits: u32,
) -> Result<u32, DifficultyError> {
    let factor = i64::from(max_factor.max(1));
    let expected = expected_secs.max(1);
    let actual = actual_secs.clamp((expected / factor).max(1), expected.saturating_mul(factor));

    let old_target = expand_compact(old_bits)?;
    let limit = expand_compact(pow_limit_bits)?;

    let mut target = old_target * BigUint::from(actual as u64) / BigUint::from(expected as u64);
    if target > limit {
        target = limit;
    }
    if target.is_zero() {
        target = BigUint::one();
    }
    Ok(compress_target(&target))
}

/// Current target plus the rolling window of recent block timestamps needed
/// to compute the next one.
#[derive(Debug, Clone)]
pub struct DifficultyState {
    bits: u32,
    window: VecDeque<(u64, DateTime<Utc>)>,
    interval: u64,
    target_block_time_secs: i64,
    max_adjustment_factor: u32,
    pow_limit_bits: u32,
}

impl DifficultyState {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            bits: params.initial_bits,
            window: VecDeque::with_capacity(params.retarget_interval as usize + 1),
            interval: params.retarget_interval,
            target_block_time_secs: params.target_block_time_secs,
            max_adjustment_factor: params.max_adjustment_factor,
            pow_limit_bits: params.pow_limit_bits,
        }
    }

    /// Bits of the current tip
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Record an accepted block
    pub fn observe(&mut self, index: u64, timestamp: DateTime<Utc>, bits: u32) {
        self.bits = bits;
        self.window.push_back((index, timestamp));
        while self.window.len() as u64 > self.interval + 1 {
            self.window.pop_front();
        }
    }

    /// Bits required of the block at `next_index`
    pub fn next_bits(&self, next_index: u64) -> u32 {
        if self.interval == 0 || next_index == 0 || next_index % self.interval != 0 {
            return self.bits;
        }

        let period_start = next_index - self.interval;
        let first = self.window.iter().find(|(index, _)| *index == period_start);
        let (Some((_, first)), Some((_, last))) = (first, self.window.back()) else {
            return self.bits;
        };

        let actual = last.signed_duration_since(*first).num_seconds();
        let expected = self.target_block_time_secs.saturating_mul(self.interval as i64);
        retarget(
            self.bits,
            actual,
            expected,
            self.max_adjustment_factor,
            self.pow_limit_bits,
        )
        .unwrap_or(self.bits)
    }
}
