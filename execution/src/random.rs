//! Sources of the uniform draw used to decide a jackpot win.

use std::sync::{Mutex, PoisonError};

use jackpot_types::strategy::RATIO_SCALE;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rust_decimal::Decimal;

/// Number of distinct draws; one per representable ratio step.
const DRAW_RESOLUTION: i64 = 1_000_000_000_000;

/// A uniform value in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn draw(&self) -> Decimal;
}

impl<R: RandomSource + ?Sized> RandomSource for Box<R> {
    fn draw(&self) -> Decimal {
        (**self).draw()
    }
}

/// Draws from the thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct UniformDraw;

impl RandomSource for UniformDraw {
    fn draw(&self) -> Decimal {
        Decimal::new(rand::thread_rng().gen_range(0..DRAW_RESOLUTION), RATIO_SCALE)
    }
}

/// Reproducible draws from a fixed seed.
pub struct SeededDraw {
    rng: Mutex<StdRng>,
}

impl SeededDraw {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededDraw {
    fn draw(&self) -> Decimal {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Decimal::new(rng.gen_range(0..DRAW_RESOLUTION), RATIO_SCALE)
    }
}

#[cfg(any(test, feature = "mocks"))]
pub(crate) mod fixed {
    use super::RandomSource;
    use rust_decimal::Decimal;
    use std::{
        collections::VecDeque,
        sync::{Mutex, PoisonError},
    };

    /// Replays scripted draws, repeating the last one once the script runs out.
    pub struct FixedDraw {
        script: Mutex<(VecDeque<Decimal>, Decimal, usize)>,
    }

    impl FixedDraw {
        pub fn always(value: Decimal) -> Self {
            Self::sequence([value])
        }

        pub fn sequence(values: impl IntoIterator<Item = Decimal>) -> Self {
            let values: VecDeque<Decimal> = values.into_iter().collect();
            let last = values.back().copied().unwrap_or(Decimal::ZERO);
            Self {
                script: Mutex::new((values, last, 0)),
            }
        }

        /// How many times [`RandomSource::draw`] has been called.
        pub fn draws(&self) -> usize {
            self.script.lock().unwrap_or_else(PoisonError::into_inner).2
        }
    }

    impl RandomSource for FixedDraw {
        fn draw(&self) -> Decimal {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            script.2 += 1;
            match script.0.pop_front() {
                Some(value) => {
                    script.1 = value;
                    value
                }
                None => script.1,
            }
        }
    }
}
