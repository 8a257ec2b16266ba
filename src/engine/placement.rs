//! Rendezvous placement of addresses over shards
//!
//! Every shard gets a weight `H(shard ID || address)`; shards are tried in
//! descending weight order. Adding or removing a shard only moves the
//! addresses that ranked it first.

use sha2::{Digest, Sha256};

use crate::object::Address;
use crate::shard::ShardId;

/// Weight of `shard` for `address`
pub fn weight(shard: &ShardId, address: &Address) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(shard.as_bytes());
    hasher.update(address.to_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Order `items` by descending weight of their shard ID for `address`
pub fn sort_by_rank<T>(items: &mut [T], address: &Address, id: impl Fn(&T) -> ShardId) {
    items.sort_by_cached_key(|item| {
        let shard = id(item);
        (std::cmp::Reverse(weight(&shard, address)), shard)
    });
}
