// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use lazy_static::lazy_static;

use super::alpha_beta_filter::FilterEstimate;
use crate::reward::math::{PRECISION, poly_parse, poly_val};

lazy_static! {
    pub static ref NUM: Vec<BigInt> = poly_parse(&[
        "261417938209272870992496419296200268025",
        "7266615505142943436908456158054846846897",
        "32458783941900493142649393804518050491988",
        "17078670566130897220338060387082146864806",
        "-35150353308172866634071793531642638290419",
        "-20351202052858059355702509232125230498980",
        "-1563932590352680681114104005183375350999",
    ])
    .unwrap();
    pub static ref DENOM: Vec<BigInt> = poly_parse(&[
        "49928077726659937662124949977867279384",
        "2508163877009111928787629628566491583994",
        "21757751789594546643737445330202599887121",
        "53400635271583923415775576342898617051826",
        "41248834748603606604000911015235164348839",
        "9015227820322455780436733526367238305537",
        "340282366920938463463374607431768211456",
    ])
    .unwrap();
    pub static ref DEFAULT_ALPHA: BigInt = "314760000000000000000000000000000000".parse().unwrap();
    pub static ref DEFAULT_BETA: BigInt = "96640100000000000000000000000000".parse().unwrap();
    pub static ref LN_2: BigInt = "235865763225513294137944142764154484399".parse().unwrap();
    pub static ref EPSILON: BigInt = "302231454903657293676544".parse().unwrap();
}

/// Extrapolate the CumSumRatio given two filtered estimates in the epoch range
/// [relativeStart, relativeStart + delta].
/// Output is in Q.128 format.
pub fn extrapolated_cum_sum_of_ratio(
    delta: ChainEpoch,
    relative_start: ChainEpoch,
    est_num: &FilterEstimate,
    est_denom: &FilterEstimate,
) -> BigInt {
    let delta_t = BigInt::from(delta) << PRECISION; // Q.0 -> Q.128
    let t0 = BigInt::from(relative_start) << PRECISION; // Q.0 -> Q.128

    let position1 = &est_num.position;
    let position2 = &est_denom.position;
    let velocity1 = &est_num.velocity;
    let velocity2 = &est_denom.velocity;

    let squared_velocity2 = (velocity2 * velocity2) >> PRECISION; // Q.256 -> Q.128

    if squared_velocity2 > *EPSILON {
        // Denominator has a significant trend; use the analytic integral of the ratio of
        // two linear functions, which requires the natural log of the denominator.
        let mut x2a = ((velocity2 * &t0) >> PRECISION) + position2; // Q.128
        let mut x2b = ((velocity2 * (&t0 + &delta_t)) >> PRECISION) + position2; // Q.128
        x2a = ln(&x2a);
        x2b = ln(&x2b);

        let m1 = ((&x2b - &x2a) * position1 * velocity2) >> PRECISION; // Q.256

        let m2l = (&x2a - &x2b) * position2; // Q.256
        let m2r = velocity2 * &delta_t; // Q.256
        let m2 = ((m2l + m2r) * velocity1) >> PRECISION; // Q.256

        return (m2 + m1).div_floor(&squared_velocity2); // Q.256 / Q.128 -> Q.128
    }

    // Denominator is essentially constant; approximate the numerator at the midpoint.
    let half_delta = &delta_t >> 1; // Q.128
    let mut x1m = velocity1 * (&t0 + half_delta); // Q.256
    x1m = (x1m >> PRECISION) + position1; // Q.128

    let x1: BigInt = x1m * delta_t;
    x1.div_floor(position2) // Q.256 / Q.128 -> Q.128
}

/// The natural log of x, specified in Q.128 format.
/// Should only use with x > 0.
/// Output is in Q.128 format.
pub fn ln(z: &BigInt) -> BigInt {
    // bitlen - 1 - precision
    let k: i64 = z.bits() as i64 - 1 - PRECISION as i64; // Q.0
    let x: BigInt = if k > 0 { z >> (k as u64) } else { z << k.unsigned_abs() }; // Q.128

    (BigInt::from(k) * &*LN_2) + ln_between_one_and_two(x)
}

/// The natural log of x, specified in Q.128 format, where 1 <= x < 2.
/// Computed by a Pade approximation.
/// Output is in Q.128 format.
fn ln_between_one_and_two(x: BigInt) -> BigInt {
    let num = poly_val(&NUM, &x) << PRECISION; // Q.256
    let denom = poly_val(&DENOM, &x);
    num.div_floor(&denom) // Q.256 / Q.128 -> Q.128
}
