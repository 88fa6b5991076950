// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use cid::Cid;
use fvm_ipld_amt::Amt;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_hamt::{BytesKey, Error as HamtError, Hamt};

use crate::builtin::HAMT_BIT_WIDTH;

/// Map type to be used within actors. The underlying type is a HAMT.
pub type Map<'bs, BS, V> = Hamt<&'bs BS, V, BytesKey>;

/// Array type used within actors. The underlying type is an AMT.
pub type Array<'bs, V, BS> = Amt<V, &'bs BS>;

/// Create a HAMT with a custom bitwidth.
pub fn make_empty_map<BS, V>(store: &'_ BS, bitwidth: u32) -> Map<'_, BS, V>
where
    BS: Blockstore,
    V: serde::de::DeserializeOwned + serde::Serialize,
{
    Map::<_, V>::new_with_bit_width(store, bitwidth)
}

/// Create a map with a root cid.
pub fn make_map_with_root<'bs, BS, V>(
    root: &Cid,
    store: &'bs BS,
) -> Result<Map<'bs, BS, V>, HamtError>
where
    BS: Blockstore,
    V: serde::de::DeserializeOwned + serde::Serialize,
{
    Map::<_, V>::load_with_bit_width(root, store, HAMT_BIT_WIDTH)
}

/// Create a map with a root cid and custom bitwidth.
pub fn make_map_with_root_and_bitwidth<'bs, BS, V>(
    root: &Cid,
    store: &'bs BS,
    bitwidth: u32,
) -> Result<Map<'bs, BS, V>, HamtError>
where
    BS: Blockstore,
    V: serde::de::DeserializeOwned + serde::Serialize,
{
    Map::<_, V>::load_with_bit_width(root, store, bitwidth)
}

/// Converts a u64 to a bytes key for a HAMT, using a varint encoding.
pub fn u64_key(k: u64) -> BytesKey {
    let mut bz = unsigned_varint::encode::u64_buffer();
    let slice = unsigned_varint::encode::u64(k, &mut bz);
    slice.to_vec().into()
}

/// Parses a varint bytes key back into a u64.
pub fn parse_uint_key(s: &[u8]) -> anyhow::Result<u64> {
    let (v, rem) = unsigned_varint::decode::u64(s).map_err(|e| anyhow!(e.to_string()))?;
    if !rem.is_empty() {
        return Err(anyhow!("trailing bytes after varint key"));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        for k in [0u64, 1, 127, 128, 1 << 20, u64::MAX] {
            assert_eq!(parse_uint_key(&u64_key(k)).unwrap(), k);
        }
    }
}
