// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use cid::multihash::{Code, MultihashDigest};
use fvm_ipld_encoding::DAG_CBOR;
use lazy_static::lazy_static;

lazy_static! {
    /// Cid of the empty array Cbor bytes (`EMPTY_ARR_BYTES`).
    pub static ref EMPTY_ARR_CID: Cid = {
        let empty = Code::Blake2b256.digest(&EMPTY_ARR_BYTES);
        Cid::new_v1(DAG_CBOR, empty)
    };
}

/// Cbor bytes of an empty array.
pub const EMPTY_ARR_BYTES: [u8; 1] = [0x80];

#[test]
fn test_empty_arr_cid() {
    use fvm_ipld_encoding::to_vec;

    let empty: [u8; 0] = [];
    let bz = to_vec(&empty).unwrap();
    assert_eq!(bz, EMPTY_ARR_BYTES);
    assert_eq!(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bz)), *EMPTY_ARR_CID);
}
