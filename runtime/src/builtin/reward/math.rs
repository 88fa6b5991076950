// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::bigint::{BigInt, ParseBigIntError};

/// Fixed-point precision (in bits) used for math in this module.
pub const PRECISION: u64 = 128;

/// Parses a string slice of numbers into a vector of BigInts.
pub fn poly_parse(coefs: &[&str]) -> Result<Vec<BigInt>, ParseBigIntError> {
    coefs.iter().map(|c| c.parse()).collect()
}

/// Evaluates a polynomial, given by coefficients in Q.128 format, at x (also Q.128),
/// using Horner's method. The result is in Q.128 format.
pub fn poly_val(poly: &[BigInt], x: &BigInt) -> BigInt {
    let mut res = BigInt::default();
    for coef in poly {
        res = ((res * x) >> PRECISION) + coef;
    }
    res
}
