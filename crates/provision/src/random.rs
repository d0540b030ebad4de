//! Random string generation for keys, identifiers, passwords and PINs.
//!
//! Characters are drawn from the base64 alphabet, one 6-bit draw per
//! character, and filtered down to the requested [`Alphabet`]. Because 64 is
//! a power of two every draw is unbiased, and so is the filtered result.
//!
//! Under [`FillPolicy::Resample`] rejected draws are simply repeated until the
//! requested length is reached. [`FillPolicy::Pad`] draws exactly `length`
//! characters once and pads whatever the filter removed with a fixed filler,
//! matching secrets produced by the older `rand -base64 | tr -dc` pipeline.
//! Padding lowers the entropy of the result and is only meant for
//! compatibility.

use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use pidgeon_core::{FillPolicy, SecretsConfig};

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Character set of a generated string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    /// `[A-Za-z0-9]`
    Alphanumeric,
    /// `[0-9]`
    Digits,
}

impl Alphabet {
    pub fn contains(&self, c: char) -> bool {
        match self {
            Alphabet::Alphanumeric => c.is_ascii_alphanumeric(),
            Alphabet::Digits => c.is_ascii_digit(),
        }
    }
}

/// Random string generator configured with a fill policy.
#[derive(Debug, Clone, Copy)]
pub struct RandomStrings {
    fill: FillPolicy,
    filler: char,
}

impl Default for RandomStrings {
    fn default() -> Self {
        Self {
            fill: FillPolicy::Resample,
            filler: '0',
        }
    }
}

impl RandomStrings {
    /// `filler` must be an ASCII digit so padding stays inside every
    /// alphabet; anything else falls back to `'0'`.
    pub fn new(fill: FillPolicy, filler: char) -> Self {
        let filler = if filler.is_ascii_digit() { filler } else { '0' };
        Self { fill, filler }
    }

    pub fn from_config(config: &SecretsConfig) -> Self {
        Self::new(config.fill, config.filler)
    }

    /// Generate a string of exactly `length` characters from `alphabet`.
    pub fn generate<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        alphabet: Alphabet,
        length: usize,
    ) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::with_capacity(length));

        match self.fill {
            FillPolicy::Resample => {
                while out.len() < length {
                    let c = draw(rng);
                    if alphabet.contains(c) {
                        out.push(c);
                    }
                }
            }
            FillPolicy::Pad => {
                for _ in 0..length {
                    let c = draw(rng);
                    if alphabet.contains(c) {
                        out.push(c);
                    }
                }
                while out.len() < length {
                    out.push(self.filler);
                }
            }
        }

        out
    }
}

fn draw<R: RngCore>(rng: &mut R) -> char {
    // top six bits select one of 64 characters
    char::from(BASE64[(rng.next_u32() >> 26) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Cycles through a fixed list of base64 indices.
    struct ScriptedRng {
        indices: Vec<u32>,
        position: usize,
    }

    impl ScriptedRng {
        fn new(indices: &[u32]) -> Self {
            Self {
                indices: indices.to_vec(),
                position: 0,
            }
        }
    }

    impl RngCore for ScriptedRng {
        fn next_u32(&mut self) -> u32 {
            let index = self.indices[self.position % self.indices.len()];
            self.position += 1;
            index << 26
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                *byte = self.next_u32() as u8;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for ScriptedRng {}

    #[test]
    fn test_exact_length_and_alphabet() {
        for fill in [FillPolicy::Resample, FillPolicy::Pad] {
            let strings = RandomStrings::new(fill, '0');
            for seed in 0..8 {
                let mut rng = StdRng::seed_from_u64(seed);
                for length in [1, 2, 7, 8, 16, 32, 33, 64, 128] {
                    let key = strings.generate(&mut rng, Alphabet::Alphanumeric, length);
                    assert_eq!(key.len(), length);
                    assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));

                    let pin = strings.generate(&mut rng, Alphabet::Digits, length);
                    assert_eq!(pin.len(), length);
                    assert!(pin.chars().all(|c| c.is_ascii_digit()));
                }
            }
        }
    }

    #[test]
    fn test_zero_length_is_empty() {
        let mut rng = StdRng::seed_from_u64(0);
        let out = RandomStrings::default().generate(&mut rng, Alphabet::Alphanumeric, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_pad_fills_rejected_draws() {
        // 'A', '+', '/', 'b' -> only 'A' and 'b' survive the filter
        let mut rng = ScriptedRng::new(&[0, 62, 63, 27]);
        let strings = RandomStrings::new(FillPolicy::Pad, '7');

        let out = strings.generate(&mut rng, Alphabet::Alphanumeric, 4);
        assert_eq!(out.as_str(), "Ab77");
    }

    #[test]
    fn test_pad_with_no_usable_entropy() {
        let mut rng = ScriptedRng::new(&[63]);
        let strings = RandomStrings::new(FillPolicy::Pad, '0');

        let out = strings.generate(&mut rng, Alphabet::Digits, 6);
        assert_eq!(out.as_str(), "000000");
    }

    #[test]
    fn test_resample_skips_rejected_draws() {
        let mut rng = ScriptedRng::new(&[0, 62, 63, 27]);
        let strings = RandomStrings::new(FillPolicy::Resample, '7');

        let out = strings.generate(&mut rng, Alphabet::Alphanumeric, 4);
        assert_eq!(out.as_str(), "AbAb");
    }

    #[test]
    fn test_digits_come_from_digit_range() {
        // 52..=61 are '0'..='9' in the base64 alphabet
        let mut rng = ScriptedRng::new(&[0, 52, 61, 26]);
        let strings = RandomStrings::new(FillPolicy::Resample, '0');

        let out = strings.generate(&mut rng, Alphabet::Digits, 4);
        assert_eq!(out.as_str(), "0909");
    }

    #[test]
    fn test_invalid_filler_falls_back_to_zero() {
        let mut rng = ScriptedRng::new(&[63]);
        let strings = RandomStrings::new(FillPolicy::Pad, 'x');

        let out = strings.generate(&mut rng, Alphabet::Alphanumeric, 3);
        assert_eq!(out.as_str(), "000");
    }
}
