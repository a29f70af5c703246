use rand::Rng;

/// Multipliers for [`Permutation`]: primes, excluding 2 and Mersenne primes (3, 7, 31, 127).
pub const PRIMES: [usize; 29] = [
    5, 11, 13, 17, 19, 23, 37, 41, 43, 47, 53, 61, 71, 73, 79, 83, 89, 97, 101, 103, 109, 113,
    131, 137, 139, 149, 151, 157, 163,
];

/// The sequence `(multiplier * i + offset) mod modulus` for `i` in `0..modulus`.
///
/// This is a permutation of `0..modulus` exactly when `multiplier` and `modulus` are coprime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permutation {
    multiplier: usize,
    offset: usize,
    modulus: usize,
}

impl Permutation {
    pub fn new(multiplier: usize, offset: usize, modulus: usize) -> Self {
        assert!(modulus > 0, "empty permutation");
        Permutation {
            multiplier,
            offset: offset % modulus,
            modulus,
        }
    }

    /// Draws a multiplier from [`PRIMES`] and an offset from `0..modulus`.
    ///
    /// If the drawn prime divides `modulus`, the next coprime prime in the table is used instead,
    /// so the result is always a permutation.
    pub fn random(rng: &mut impl Rng, modulus: usize) -> Self {
        let drawn = rng.random_range(0..PRIMES.len());
        let offset = rng.random_range(0..modulus);
        Self::new(coprime_multiplier(drawn, modulus), offset, modulus)
    }

    pub fn multiplier(&self) -> usize {
        self.multiplier
    }

    pub fn len(&self) -> usize {
        self.modulus
    }

    pub fn get(&self, i: usize) -> usize {
        ((self.multiplier as u128 * i as u128 + self.offset as u128) % self.modulus as u128) as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.modulus).map(|i| self.get(i))
    }
}

/// First prime in [`PRIMES`], starting at index `start` and wrapping around, coprime with `modulus`.
pub fn coprime_multiplier(start: usize, modulus: usize) -> usize {
    PRIMES
        .iter()
        .cycle()
        .skip(start % PRIMES.len())
        .take(PRIMES.len())
        .copied()
        .find(|&p| gcd(p, modulus) == 1)
        .unwrap_or(1)
}

pub fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    fn is_bijection(p: &Permutation) -> bool {
        let mut seen = vec![false; p.len()];
        for x in p.iter() {
            if std::mem::replace(&mut seen[x], true) {
                return false;
            }
        }
        seen.into_iter().all(|s| s)
    }

    #[test]
    fn table_against_small_moduli() {
        let mut non_coprime = Vec::new();
        for modulus in 1..=512 {
            for &prime in &PRIMES {
                let p = Permutation::new(prime, modulus / 2, modulus);
                let coprime = gcd(prime, modulus) == 1;
                assert_eq!(is_bijection(&p), coprime, "{prime} mod {modulus}");
                if !coprime {
                    non_coprime.push((modulus, prime));
                }
            }
        }
        // every table prime divides some modulus in range, so the plain table is not enough
        assert!(non_coprime.contains(&(5, 5)));
        assert!(non_coprime.contains(&(326, 163)));
        for &prime in &PRIMES {
            assert!(non_coprime.iter().any(|&(_, p)| p == prime));
        }
    }

    #[test]
    fn coprime_replacement() {
        assert_eq!(coprime_multiplier(0, 5), 11);
        assert_eq!(coprime_multiplier(0, 55), 13);
        assert_eq!(coprime_multiplier(28, 163), 5);
        assert_eq!(coprime_multiplier(3, 64), 17);
        let product: usize = PRIMES.iter().take(12).product();
        assert_eq!(coprime_multiplier(0, product), 71);
    }

    #[test]
    fn one_element() {
        let p = Permutation::new(5, 3, 1);
        assert_eq!(p.iter().collect::<Vec<_>>(), [0]);
    }

    proptest! {
        #[test]
        fn random_permutations_are_bijections(modulus in 1usize..2000, seed: u64) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let p = Permutation::random(&mut rng, modulus);
            prop_assert_eq!(gcd(p.multiplier(), modulus), 1);
            prop_assert!(is_bijection(&p));
        }
    }
}
