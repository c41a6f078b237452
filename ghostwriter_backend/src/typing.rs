//! Human-like typing pace for outgoing replies.

use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Per-word typing parameters. Both profiles run through [`typing_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingProfile {
    pub words_per_minute: f64,
    pub sigma: f64,
    pub min_per_word_secs: f64,
    pub max_per_word_secs: f64,
}

impl TypingProfile {
    /// Realistic pace for interactive replies.
    pub fn paced() -> Self {
        Self {
            words_per_minute: 100.0,
            sigma: 0.3,
            min_per_word_secs: 0.5,
            max_per_word_secs: 3.0,
        }
    }

    /// Near-zero pace for catch-up processing.
    pub fn instant() -> Self {
        Self {
            words_per_minute: 100.0,
            sigma: 0.3,
            min_per_word_secs: 0.0,
            max_per_word_secs: 0.05,
        }
    }

    pub fn delay_for(&self, text: &str) -> Duration {
        self.delay_with(text, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> Duration {
        let secs = typing_delay_with(
            text,
            self.words_per_minute,
            self.sigma,
            self.min_per_word_secs,
            self.max_per_word_secs,
            rng,
        );
        Duration::from_secs_f64(secs)
    }
}

impl Default for TypingProfile {
    fn default() -> Self {
        Self::paced()
    }
}

/// Seconds it would take to type `text`: one clamped Gaussian draw per word,
/// ignoring tokens shorter than two characters.
pub fn typing_delay(
    text: &str,
    words_per_minute: f64,
    sigma: f64,
    min_per_word: f64,
    max_per_word: f64,
) -> f64 {
    typing_delay_with(
        text,
        words_per_minute,
        sigma,
        min_per_word,
        max_per_word,
        &mut rand::thread_rng(),
    )
}

pub fn typing_delay_with<R: Rng + ?Sized>(
    text: &str,
    words_per_minute: f64,
    sigma: f64,
    min_per_word: f64,
    max_per_word: f64,
    rng: &mut R,
) -> f64 {
    let mean = 60.0 / words_per_minute.max(f64::MIN_POSITIVE);
    let normal = Normal::new(mean, sigma.abs()).ok();

    text.split_whitespace()
        .filter(|word| word.chars().count() >= 2)
        .map(|_| {
            let draw = match &normal {
                Some(n) => n.sample(rng),
                None => mean,
            };
            draw.max(min_per_word).min(max_per_word)
        })
        .sum::<f64>()
        .max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn short_tokens_cost_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(typing_delay_with("a b c ! ?", 100.0, 0.3, 0.5, 3.0, &mut rng), 0.0);
        assert_eq!(typing_delay_with("", 100.0, 0.3, 0.5, 3.0, &mut rng), 0.0);
    }

    #[test]
    fn each_word_is_clamped() {
        let mut rng = StdRng::seed_from_u64(7);
        let text = "one two three four five six seven eight nine ten";
        for _ in 0..200 {
            let secs = typing_delay_with(text, 100.0, 5.0, 0.5, 3.0, &mut rng);
            assert!((5.0..=30.0).contains(&secs), "got {}", secs);
        }
    }

    #[test]
    fn zero_sigma_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(3);
        let secs = typing_delay_with("hello there friend", 60.0, 0.0, 0.0, 10.0, &mut rng);
        assert!((secs - 3.0).abs() < 1e-9);
    }

    #[test]
    fn instant_profile_stays_near_zero() {
        let mut rng = StdRng::seed_from_u64(11);
        let text = "word ".repeat(40);
        let delay = TypingProfile::instant().delay_with(&text, &mut rng);
        assert!(delay <= Duration::from_secs(2));

        let paced = TypingProfile::paced().delay_with(&text, &mut rng);
        assert!(paced >= Duration::from_secs(20));
    }
}
