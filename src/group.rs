use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::RngCore;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::constants::{GENERATOR_CANDIDATE_BUDGET, MILLER_RABIN_ROUNDS, PRIME_CANDIDATE_BUDGET};
use crate::error::{Error, Result};

/// Small primes used to cheaply reject most composites before Miller-Rabin.
const SMALL_PRIMES: [u32; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Multiplicative group modulo a random prime, the cryptographic setting for
/// oblivious transfer.
///
/// Serializes as the pair `(prime, generator)` so one party can transmit the
/// group to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeGroup {
    prime: BigUint,
    generator: BigUint,
}

impl PrimeGroup {
    /// Generate a fresh group: a random prime of `bits` bits and a generator
    /// of the full multiplicative group.
    pub fn generate(bits: u64, rng: &mut ChaCha12Rng) -> Result<Self> {
        if bits < 8 {
            return Err(Error::Group(format!(
                "prime width {bits} too small, need at least 8 bits"
            )));
        }
        let prime = random_prime(bits, rng)?;
        let generator = find_generator(&prime, rng)?;
        Ok(PrimeGroup { prime, generator })
    }

    /// The prime modulus.
    pub fn prime(&self) -> &BigUint {
        &self.prime
    }

    /// The group generator.
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Multiply two elements.
    pub fn mul(&self, a: &BigUint, b: &BigUint) -> BigUint {
        (a * b) % &self.prime
    }

    /// Raise an element to a power.
    pub fn pow(&self, base: &BigUint, exponent: &BigUint) -> BigUint {
        base.modpow(exponent, &self.prime)
    }

    /// Raise the generator to a power.
    pub fn gen_pow(&self, exponent: &BigUint) -> BigUint {
        self.generator.modpow(exponent, &self.prime)
    }

    /// Multiplicative inverse via Fermat's little theorem.
    pub fn inv(&self, value: &BigUint) -> BigUint {
        value.modpow(&(&self.prime - 2u32), &self.prime)
    }

    /// Uniform element of `[1, prime - 1]`.
    pub fn rand_int(&self, rng: &mut ChaCha12Rng) -> BigUint {
        loop {
            let candidate = random_below(&self.prime, rng);
            if !candidate.is_zero() {
                return candidate;
            }
        }
    }

    /// Sanity-check a group received from the peer: the modulus must be an
    /// odd probable prime and the generator a nontrivial element.
    pub fn validate(&self, rng: &mut ChaCha12Rng) -> Result<()> {
        if !is_probable_prime(&self.prime, rng) {
            return Err(Error::Group("received modulus is not prime".into()));
        }
        if self.generator <= BigUint::one() || self.generator >= self.prime {
            return Err(Error::Group("received generator out of range".into()));
        }
        Ok(())
    }
}

/// Uniform value below `bound` by rejection sampling over `bound.bits()` bits.
fn random_below(bound: &BigUint, rng: &mut ChaCha12Rng) -> BigUint {
    let bits = bound.bits();
    loop {
        let candidate = random_bits(bits, rng);
        if &candidate < bound {
            return candidate;
        }
    }
}

/// Uniform value of at most `bits` bits.
fn random_bits(bits: u64, rng: &mut ChaCha12Rng) -> BigUint {
    let nbytes = bits.div_ceil(8) as usize;
    let mut buf = vec![0u8; nbytes];
    rng.fill_bytes(&mut buf);
    let excess = (nbytes as u64 * 8 - bits) as u32;
    buf[0] &= 0xffu8 >> excess;
    BigUint::from_bytes_be(&buf)
}

/// Random probable prime of exactly `bits` bits.
fn random_prime(bits: u64, rng: &mut ChaCha12Rng) -> Result<BigUint> {
    for _ in 0..PRIME_CANDIDATE_BUDGET {
        let nbytes = bits.div_ceil(8) as usize;
        let mut buf = vec![0u8; nbytes];
        rng.fill_bytes(&mut buf);
        let excess = (nbytes as u64 * 8 - bits) as u32;
        buf[0] &= 0xffu8 >> excess;
        // Force the top bit for exact width and the low bit for oddness.
        buf[0] |= 0x80u8 >> excess;
        buf[nbytes - 1] |= 1;
        let candidate = BigUint::from_bytes_be(&buf);
        if is_probable_prime(&candidate, rng) {
            return Ok(candidate);
        }
    }
    Err(Error::Group(format!(
        "no {bits}-bit prime found within candidate budget"
    )))
}

/// Miller-Rabin probable-prime test with random bases.
pub(crate) fn is_probable_prime(n: &BigUint, rng: &mut ChaCha12Rng) -> bool {
    for &p in &SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }
    if n < &BigUint::from(2u32) {
        return false;
    }

    let one = BigUint::one();
    let n_m1 = n - &one;
    let s = n_m1.trailing_zeros().unwrap_or(0);
    let d = &n_m1 >> s;

    'witness: for _ in 0..MILLER_RABIN_ROUNDS {
        let base = loop {
            let candidate = random_below(n, rng);
            if candidate > one {
                break candidate;
            }
        };
        let mut x = base.modpow(&d, n);
        if x == one || x == n_m1 {
            continue;
        }
        for _ in 1..s {
            x = (&x * &x) % n;
            if x == n_m1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Distinct prime factors of `value`: trial division by small primes, then
/// Pollard's rho for any stubborn composite cofactor.
fn prime_factors(value: &BigUint, rng: &mut ChaCha12Rng) -> BTreeSet<BigUint> {
    let mut factors = BTreeSet::new();
    let mut stack = vec![value.clone()];
    while let Some(m) = stack.pop() {
        if m.is_one() {
            continue;
        }
        if is_probable_prime(&m, rng) {
            factors.insert(m);
            continue;
        }
        let d = find_factor(&m, rng);
        stack.push(&m / &d);
        stack.push(d);
    }
    factors
}

/// Some nontrivial factor of the composite `n`.
fn find_factor(n: &BigUint, rng: &mut ChaCha12Rng) -> BigUint {
    for &p in &SMALL_PRIMES {
        let p = BigUint::from(p);
        if (n % &p).is_zero() {
            return p;
        }
    }
    let mut d = BigUint::from(41u32);
    let limit = BigUint::from(1u32 << 16);
    while d < limit {
        if (n % &d).is_zero() {
            return d;
        }
        d += 2u32;
    }
    pollard_rho(n, rng)
}

/// Pollard's rho cycle-finding; `n` must be odd, composite and free of small
/// factors.
fn pollard_rho(n: &BigUint, rng: &mut ChaCha12Rng) -> BigUint {
    let one = BigUint::one();
    loop {
        let mut x = random_below(n, rng);
        let mut y = x.clone();
        let c = random_below(n, rng) + &one;
        let step = |v: &BigUint| (v * v + &c) % n;
        loop {
            x = step(&x);
            y = step(&step(&y));
            let diff = if x > y { &x - &y } else { &y - &x };
            if diff.is_zero() {
                // Cycle without a factor; retry with new parameters.
                break;
            }
            let d = diff.gcd(n);
            if !d.is_one() {
                return d;
            }
        }
    }
}

/// Find a generator of the full multiplicative group mod `prime`.
///
/// A candidate generates iff it is no root of unity for any prime factor of
/// the group order.
fn find_generator(prime: &BigUint, rng: &mut ChaCha12Rng) -> Result<BigUint> {
    let one = BigUint::one();
    let order = prime - &one;
    let factors = prime_factors(&order, rng);

    for _ in 0..GENERATOR_CANDIDATE_BUDGET {
        let candidate = loop {
            let c = random_below(prime, rng);
            if !c.is_zero() {
                break c;
            }
        };
        let generates = factors
            .iter()
            .all(|factor| candidate.modpow(&(&order / factor), prime) != one);
        if generates {
            return Ok(candidate);
        }
    }
    Err(Error::Group(
        "no generator found within candidate budget".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn test_rng() -> ChaCha12Rng {
        ChaCha12Rng::from_seed([3u8; 32])
    }

    #[test]
    fn test_miller_rabin_known_values() {
        let mut rng = test_rng();
        for p in [2u32, 3, 5, 17, 257, 65537, 7919] {
            assert!(is_probable_prime(&BigUint::from(p), &mut rng), "{p}");
        }
        for c in [1u32, 4, 15, 91, 341, 561, 65535] {
            assert!(!is_probable_prime(&BigUint::from(c), &mut rng), "{c}");
        }
    }

    #[test]
    fn test_prime_factors() {
        let mut rng = test_rng();
        let factors = prime_factors(&BigUint::from(720u32), &mut rng);
        let expected: BTreeSet<BigUint> =
            [2u32, 3, 5].into_iter().map(BigUint::from).collect();
        assert_eq!(factors, expected);

        // Semiprime beyond the trial-division window exercises Pollard rho.
        let a = BigUint::from(1_000_003u64);
        let b = BigUint::from(1_000_033u64);
        let factors = prime_factors(&(&a * &b), &mut rng);
        assert_eq!(factors, [a, b].into_iter().collect());
    }

    #[test]
    fn test_generated_prime_has_requested_width() {
        let mut rng = test_rng();
        for bits in [16u64, 24, 32] {
            let group = PrimeGroup::generate(bits, &mut rng).unwrap();
            assert_eq!(group.prime().bits(), bits);
        }
    }

    #[test]
    fn test_group_laws() {
        let mut rng = test_rng();
        let group = PrimeGroup::generate(16, &mut rng).unwrap();
        let one = BigUint::one();

        // Fermat: g^(p-1) = 1.
        assert_eq!(group.pow(group.generator(), &(group.prime() - &one)), one);

        // inv(x) * x = 1 for random elements.
        for _ in 0..20 {
            let x = group.rand_int(&mut rng);
            assert_eq!(group.mul(&group.inv(&x), &x), one);
        }
    }

    #[test]
    fn test_generator_spans_group() {
        // For a small prime, the generator's powers must enumerate every
        // element of [1, p-1].
        let mut rng = test_rng();
        let group = PrimeGroup::generate(8, &mut rng).unwrap();
        let p: u64 = group.prime().try_into().unwrap();

        let mut seen = std::collections::HashSet::new();
        let mut x = BigUint::one();
        for _ in 0..p - 1 {
            x = group.mul(&x, group.generator());
            seen.insert(x.clone());
        }
        assert_eq!(seen.len() as u64, p - 1);
    }

    #[test]
    fn test_generator_criterion_for_random_16_bit_primes() {
        let mut rng = test_rng();
        for _ in 0..5 {
            let group = PrimeGroup::generate(16, &mut rng).unwrap();
            let order = group.prime() - BigUint::one();
            for factor in prime_factors(&order, &mut rng) {
                assert_ne!(
                    group.pow(group.generator(), &(&order / &factor)),
                    BigUint::one()
                );
            }
        }
    }

    #[test]
    fn test_rand_int_in_range() {
        let mut rng = test_rng();
        let group = PrimeGroup::generate(16, &mut rng).unwrap();
        for _ in 0..100 {
            let x = group.rand_int(&mut rng);
            assert!(x >= BigUint::one() && &x < group.prime());
        }
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut rng = test_rng();
        let group = PrimeGroup::generate(16, &mut rng).unwrap();
        let json = serde_json::to_string(&group).unwrap();
        let restored: PrimeGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, group);
    }

    #[test]
    fn test_validate_rejects_composite_modulus() {
        let mut rng = test_rng();
        let bogus = PrimeGroup {
            prime: BigUint::from(91u32),
            generator: BigUint::from(3u32),
        };
        assert!(matches!(bogus.validate(&mut rng), Err(Error::Group(_))));
    }
}
