//! Axis Digit Shuffling
//!
//! Draws the 0-9 digit permutations assigned to the grid axes at lock time
//! and on each quarter reveal. The generator is injected (seeded in tests,
//! entropy in production) and every draw is an unbiased Fisher-Yates
//! shuffle, so no digit is favored for any position.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use crate::models::AxisNumbers;

pub struct DigitShuffler {
    rng: Mutex<ChaCha8Rng>,
}

impl DigitShuffler {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// Deterministic shuffler for tests and staging reproducibility.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn draw_axis(&self) -> [u8; 10] {
        let mut digits: [u8; 10] = core::array::from_fn(|i| i as u8);
        digits.shuffle(&mut *self.rng.lock());
        digits
    }

    /// Independent home and away permutations for one digit set.
    pub fn draw_pair(&self) -> AxisNumbers {
        AxisNumbers {
            home: self.draw_axis(),
            away: self.draw_axis(),
        }
    }
}

/// Commitment digest published alongside a digit set so participants can
/// verify after the fact that the set was not swapped.
pub fn axis_commit_digest(pool_id: &str, period: &str, axis: &AxisNumbers) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pool_id.as_bytes());
    hasher.update(b"|");
    hasher.update(period.as_bytes());
    hasher.update(b"|");
    hasher.update(axis.home);
    hasher.update(b"|");
    hasher.update(axis.away);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_draw_is_a_permutation() {
        let shuffler = DigitShuffler::seeded(7);
        for _ in 0..500 {
            let pair = shuffler.draw_pair();
            assert!(pair.is_permutation());
        }
    }

    #[test]
    fn same_seed_reproduces_the_same_sequence() {
        let a = DigitShuffler::seeded(42);
        let b = DigitShuffler::seeded(42);
        for _ in 0..10 {
            assert_eq!(a.draw_pair(), b.draw_pair());
        }
    }

    #[test]
    fn positions_are_not_biased() {
        // 1000 draws, each digit lands in each position ~100 times. The
        // seed is fixed, so the bound is deterministic; it is set wide
        // enough that only a broken shuffle could breach it.
        let shuffler = DigitShuffler::seeded(1234);
        let mut counts = [[0u32; 10]; 10];
        for _ in 0..1000 {
            let axis = shuffler.draw_axis();
            for (pos, &digit) in axis.iter().enumerate() {
                counts[pos][digit as usize] += 1;
            }
        }
        for (pos, row) in counts.iter().enumerate() {
            for (digit, &n) in row.iter().enumerate() {
                assert!(
                    (40..=180).contains(&n),
                    "digit {digit} in position {pos} appeared {n} times in 1000 draws"
                );
            }
        }
    }

    #[test]
    fn digest_is_stable_and_input_sensitive() {
        let axis = AxisNumbers {
            home: [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
            away: [9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
        };
        let d1 = axis_commit_digest("pool-1", "Q1", &axis);
        let d2 = axis_commit_digest("pool-1", "Q1", &axis);
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);

        assert_ne!(d1, axis_commit_digest("pool-2", "Q1", &axis));
        assert_ne!(d1, axis_commit_digest("pool-1", "Q2", &axis));

        let other = AxisNumbers {
            home: [1, 0, 2, 3, 4, 5, 6, 7, 8, 9],
            ..axis
        };
        assert_ne!(d1, axis_commit_digest("pool-1", "Q1", &other));
    }
}
