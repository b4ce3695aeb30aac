use rand::SeedableRng;
use rand::distr::Uniform;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::KernelError;

const TRUNCATION_SIGMAS: f64 = 2.0;
const TRUNCATION_TRIES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RandomFill {
    Uniform { lower: f64, upper: f64 },
    Normal { mean: f64, std: f64 },
    TruncatedNormal { mean: f64, std: f64 },
}

impl RandomFill {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform { .. } => "uniform",
            Self::Normal { .. } => "normal",
            Self::TruncatedNormal { .. } => "truncated_normal",
        }
    }
}

#[derive(Debug, Clone)]
enum Source {
    Uniform(Uniform<f64>),
    Normal(Normal<f64>),
    Truncated { normal: Normal<f64>, mean: f64, std: f64 },
}

/// Counter-based sampler: the value for a sequence index depends only on
/// the seed and that index.
#[derive(Debug, Clone)]
pub struct Sampler {
    source: Source,
    seed: u64,
}

impl Sampler {
    pub fn new(fill: RandomFill, seed: u64) -> Result<Self, KernelError> {
        let source = match fill {
            RandomFill::Uniform { lower, upper } => {
                let uniform = Uniform::new(lower, upper).map_err(|err| {
                    KernelError::InvalidParameter {
                        reason: format!("uniform bounds [{lower}, {upper}): {err}"),
                    }
                })?;
                Source::Uniform(uniform)
            }
            RandomFill::Normal { mean, std } => Source::Normal(normal(mean, std)?),
            RandomFill::TruncatedNormal { mean, std } => Source::Truncated {
                normal: normal(mean, std)?,
                mean,
                std,
            },
        };
        Ok(Self { source, seed })
    }

    #[must_use]
    pub fn sample(&self, sequence: u32) -> f64 {
        let mut rng = StdRng::seed_from_u64(mix(self.seed, sequence));
        match &self.source {
            Source::Uniform(uniform) => uniform.sample(&mut rng),
            Source::Normal(normal) => normal.sample(&mut rng),
            Source::Truncated { normal, mean, std } => {
                let low = mean - TRUNCATION_SIGMAS * std;
                let high = mean + TRUNCATION_SIGMAS * std;
                let mut value = *mean;
                for _ in 0..TRUNCATION_TRIES {
                    value = normal.sample(&mut rng);
                    if (low..=high).contains(&value) {
                        return value;
                    }
                }
                value.clamp(low, high)
            }
        }
    }
}

fn normal(mean: f64, std: f64) -> Result<Normal<f64>, KernelError> {
    Normal::new(mean, std).map_err(|err| KernelError::InvalidParameter {
        reason: format!("normal(mean={mean}, std={std}): {err}"),
    })
}

// splitmix64 finalizer over the seed and the sequence index
fn mix(seed: u64, sequence: u32) -> u64 {
    let mut z = seed ^ u64::from(sequence).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::{RandomFill, Sampler};

    #[test]
    fn samples_are_a_function_of_seed_and_sequence() {
        let sampler = Sampler::new(RandomFill::Normal { mean: 0.0, std: 1.0 }, 7)
            .expect("valid normal");
        let again = Sampler::new(RandomFill::Normal { mean: 0.0, std: 1.0 }, 7)
            .expect("valid normal");
        for sequence in 0..32 {
            assert_eq!(sampler.sample(sequence), again.sample(sequence));
        }
        assert_ne!(sampler.sample(0), sampler.sample(1));
    }

    #[test]
    fn uniform_and_truncated_normal_stay_in_range() {
        let uniform = Sampler::new(RandomFill::Uniform { lower: -1.0, upper: 3.0 }, 11)
            .expect("valid bounds");
        let truncated = Sampler::new(RandomFill::TruncatedNormal { mean: 5.0, std: 0.5 }, 11)
            .expect("valid normal");
        for sequence in 0..256 {
            let value = uniform.sample(sequence);
            assert!((-1.0..3.0).contains(&value), "uniform sample {value}");
            let value = truncated.sample(sequence);
            assert!((4.0..=6.0).contains(&value), "truncated sample {value}");
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let err = Sampler::new(RandomFill::Uniform { lower: 2.0, upper: 2.0 }, 0)
            .expect_err("empty range");
        assert!(err.to_string().contains("uniform"));
        assert!(Sampler::new(RandomFill::Normal { mean: 0.0, std: -1.0 }, 0).is_err());
    }
}
