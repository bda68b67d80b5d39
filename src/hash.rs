//! Discrete-exponentiation commitments over a prime field.
//!
//! A share set summing to `S` is committed to as `g^S mod p`. Commitments
//! combine by multiplication, so servers' partial proofs multiply into the
//! proof of the total. Clients blind their commitments with nonces; one
//! participant publishes a closing term that makes the blinding cancel.

use num::{BigUint, Integer, One, Zero};

use crate::worker::{AggregationError, Result};

const WITNESSES: [u32; 16] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53];

/// How the closing term of a blinded round is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingMethod {
	Totient,
	Inverse,
}

pub fn sum<'a, I>(values: I) -> BigUint
where
	I: IntoIterator<Item = &'a BigUint>,
{
	values.into_iter().fold(BigUint::zero(), |acc, v| acc + v)
}

/// `(Σ shares) mod p`
pub fn partial_eval<'a, I>(shares: I, modulus: &BigUint) -> BigUint
where
	I: IntoIterator<Item = &'a BigUint>,
{
	sum(shares) % modulus
}

pub fn hash(input: &BigUint, modulus: &BigUint, generator: &BigUint) -> BigUint {
	generator.modpow(input, modulus)
}

/// `g^(Σ shares) mod p`
pub fn homomorphic_partial_proof<'a, I>(shares: I, modulus: &BigUint, generator: &BigUint) -> BigUint
where
	I: IntoIterator<Item = &'a BigUint>,
{
	hash(&sum(shares), modulus, generator)
}

/// Closing term from the group order: with `t = p - 1` and `s = Σ nonces`,
/// returns `g^(t·ceil(s/t) - s)`, so the nonce exponents add up to a multiple of `t`.
pub fn last_client_proof<'a, I>(nonces: I, modulus: &BigUint, generator: &BigUint) -> Result<BigUint>
where
	I: IntoIterator<Item = &'a BigUint>,
{
	let totient = euler_totient(modulus)?;
	let nonce_sum = sum(nonces);
	let ceil = (&nonce_sum + &totient - 1u32) / &totient;
	let result = (&totient * ceil - &nonce_sum) % modulus;
	Ok(hash(&result, modulus, generator))
}

/// Closing term `(g^-1)^(Σ nonces) mod p`.
pub fn last_client_proof_inverse<'a, I>(nonces: I, modulus: &BigUint, generator: &BigUint) -> Result<BigUint>
where
	I: IntoIterator<Item = &'a BigUint>,
{
	let nonce_sum = sum(nonces);
	let inverse = mod_inverse(generator, modulus).ok_or(AggregationError::NoInverse)?;
	Ok(inverse.modpow(&nonce_sum, modulus))
}

pub fn closing_term<'a, I>(method: ClosingMethod, nonces: I, modulus: &BigUint, generator: &BigUint) -> Result<BigUint>
where
	I: IntoIterator<Item = &'a BigUint>,
{
	match method {
		ClosingMethod::Totient => last_client_proof(nonces, modulus, generator),
		ClosingMethod::Inverse => last_client_proof_inverse(nonces, modulus, generator),
	}
}

fn euler_totient(prime: &BigUint) -> Result<BigUint> {
	if !is_probable_prime(prime) {
		return Err(AggregationError::NotPrimeModulus);
	}
	Ok(prime - 1u32)
}

pub fn mod_inverse(value: &BigUint, modulus: &BigUint) -> Option<BigUint> {
	if modulus.is_zero() {
		return None;
	}
	let m: num::BigInt = modulus.clone().into();
	let a: num::BigInt = (value % modulus).into();
	let egcd = a.extended_gcd(&m);
	if !egcd.gcd.is_one() {
		return None;
	}
	egcd.x.mod_floor(&m).to_biguint()
}

/// Miller-Rabin over fixed prime witnesses.
pub fn is_probable_prime(n: &BigUint) -> bool {
	let two = BigUint::from(2u32);
	if *n < two {
		return false;
	}
	for w in WITNESSES.iter() {
		let w = BigUint::from(*w);
		if *n == w {
			return true;
		}
		if (n % &w).is_zero() {
			return false;
		}
	}

	let n_minus_one: BigUint = n - 1u32;
	let mut d = n_minus_one.clone();
	let mut r = 0u32;
	while d.is_even() {
		d >>= 1;
		r += 1;
	}

	'witness: for w in WITNESSES.iter() {
		let mut x = BigUint::from(*w).modpow(&d, n);
		if x.is_one() || x == n_minus_one {
			continue;
		}
		for _ in 1..r {
			x = x.modpow(&two, n);
			if x == n_minus_one {
				continue 'witness;
			}
		}
		return false;
	}
	true
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::seq::SliceRandom;
	use rand::{thread_rng, Rng};

	fn big(values: &[u64]) -> Vec<BigUint> {
		values.iter().map(|v| BigUint::from(*v)).collect()
	}

	fn p() -> BigUint {
		BigUint::from(23u32)
	}

	fn g() -> BigUint {
		BigUint::from(5u32)
	}

	#[test]
	fn partial_eval_is_sum_mod_p() {
		let shares = big(&[4, 7, 9]);
		assert_eq!(partial_eval(&shares, &p()), BigUint::from(20u32));
		let shares = big(&[22, 22, 22]);
		assert_eq!(partial_eval(&shares, &p()), BigUint::from(66u32 % 23));
	}

	#[test]
	fn partial_eval_ignores_order() {
		let mut rng = thread_rng();
		let prime = BigUint::from(3073700804129980417u64);
		let mut shares: Vec<BigUint> = (0..20).map(|_| BigUint::from(rng.gen::<u64>())).collect();
		let expected = partial_eval(&shares, &prime);
		shares.shuffle(&mut rng);
		assert_eq!(partial_eval(&shares, &prime), expected);
	}

	#[test]
	fn proof_commits_to_sum() {
		// 5^20 mod 23 by repeated multiplication
		let mut reference = 1u64;
		for _ in 0..20 {
			reference = reference * 5 % 23;
		}
		let shares = big(&[4, 7, 9]);
		assert_eq!(homomorphic_partial_proof(&shares, &p(), &g()), BigUint::from(reference));
		assert_eq!(reference, 12);
	}

	#[test]
	fn proofs_multiply_to_proof_of_union() {
		let mut rng = thread_rng();
		let prime = BigUint::from(3073700804129980417u64);
		let gen = BigUint::from(5u32);
		let a: Vec<BigUint> = (0..5).map(|_| BigUint::from(rng.gen::<u32>())).collect();
		let b: Vec<BigUint> = (0..7).map(|_| BigUint::from(rng.gen::<u32>())).collect();
		let union: Vec<BigUint> = a.iter().chain(b.iter()).cloned().collect();

		let combined = homomorphic_partial_proof(&a, &prime, &gen) * homomorphic_partial_proof(&b, &prime, &gen) % &prime;
		assert_eq!(combined, homomorphic_partial_proof(&union, &prime, &gen));
	}

	fn blinded_product(nonces: &[BigUint], closing: &BigUint) -> BigUint {
		nonces
			.iter()
			.fold(closing.clone(), |acc, n| acc * hash(n, &p(), &g()) % p())
	}

	#[test]
	fn closing_terms_cancel_blinding() {
		for nonces in [big(&[3, 8, 15]), big(&[0]), big(&[22, 44, 1000, 7]), big(&[11])] {
			let totient = last_client_proof(&nonces, &p(), &g()).unwrap();
			let inverse = last_client_proof_inverse(&nonces, &p(), &g()).unwrap();
			assert_eq!(blinded_product(&nonces, &totient), BigUint::one());
			assert_eq!(blinded_product(&nonces, &inverse), BigUint::one());
			assert_eq!(totient, inverse);
		}
	}

	#[test]
	fn closing_methods_agree_on_large_prime() {
		let mut rng = thread_rng();
		let prime = BigUint::from(3073700804129980417u64);
		let gen = BigUint::from(5u32);
		let nonces: Vec<BigUint> = (0..10).map(|_| BigUint::from(rng.gen::<u64>())).collect();
		assert_eq!(
			closing_term(ClosingMethod::Totient, &nonces, &prime, &gen).unwrap(),
			closing_term(ClosingMethod::Inverse, &nonces, &prime, &gen).unwrap()
		);
	}

	#[test]
	fn composite_modulus_has_no_totient() {
		let nonces = big(&[1, 2]);
		assert_eq!(
			last_client_proof(&nonces, &BigUint::from(21u32), &g()),
			Err(AggregationError::NotPrimeModulus)
		);
		// Carmichael number
		assert_eq!(
			last_client_proof(&nonces, &BigUint::from(561u32), &g()),
			Err(AggregationError::NotPrimeModulus)
		);
	}

	#[test]
	fn inverse_requires_coprime_generator() {
		let nonces = big(&[1]);
		assert_eq!(
			last_client_proof_inverse(&nonces, &BigUint::from(21u32), &BigUint::from(7u32)),
			Err(AggregationError::NoInverse)
		);
	}

	#[test]
	fn primality() {
		for prime in [2u64, 3, 23, 1009, 3073700804129980417] {
			assert!(is_probable_prime(&BigUint::from(prime)), "{}", prime);
		}
		for composite in [0u64, 1, 4, 561, 1105, 1022117, 3215031751] {
			assert!(!is_probable_prime(&BigUint::from(composite)), "{}", composite);
		}
	}
}
