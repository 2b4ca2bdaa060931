//! Scarcity bookkeeping, driven by `PEER_BITFIELD`/`PEER_HAVE` events, and
//! the block refill scheduler's sort order.

use std::cmp::Reverse;

use crate::torrent::block::{Block, Priority};
use crate::{Bitfield, PieceIndex};

/// Increments the scarcity counter of every block whose containing piece is
/// set in `bitfield`.
pub(crate) fn apply_bitfield(
    blocks: &mut [Block],
    blocks_per_piece: &[usize],
    bitfield: &Bitfield,
) {
    let mut start = 0;
    for (piece, &count) in blocks_per_piece.iter().enumerate() {
        let has = piece < bitfield.len() && bitfield[piece];
        if has {
            for block in &mut blocks[start..start + count] {
                block.bump_scarcity();
            }
        }
        start += count;
    }
}

/// Increments the scarcity counter of every block in `piece`.
pub(crate) fn apply_have(
    blocks: &mut [Block],
    blocks_per_piece: &[usize],
    piece: PieceIndex,
) {
    let start: usize = blocks_per_piece[..piece].iter().sum();
    let count = blocks_per_piece[piece];
    for block in &mut blocks[start..start + count] {
        block.bump_scarcity();
    }
}

type SortKey = (bool, bool, u8, Reverse<bool>, bool, u8, usize);

/// The refill scheduler's interest key: `(dnd asc, have asc, request_count
/// asc, high_priority desc, low_priority asc, scarcity asc, block_index
/// asc)`.
fn sort_key(block: &Block, index: usize) -> SortKey {
    (
        block.dnd,
        block.have,
        block.request_count,
        Reverse(block.priority == Priority::High),
        block.priority == Priority::Low,
        block.scarcity,
        index,
    )
}

/// Returns block indices in refill order. The caller walks this order and
/// restores index order once the tick's peer pool is exhausted; this
/// function never mutates `blocks`.
pub(crate) fn refill_order(blocks: &[Block]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..blocks.len()).collect();
    order.sort_by_key(|&i| sort_key(&blocks[i], i));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn have_and_dnd_blocks_sort_last() {
        let mut blocks = vec![
            Block::new(Priority::Normal),
            Block::new(Priority::Normal),
            Block::new(Priority::Normal),
            Block::new(Priority::High),
        ];
        blocks[1].have = true;
        blocks[2].dnd = true;

        let order = refill_order(&blocks);
        assert_eq!(order, vec![3, 0, 1, 2]);
    }

    #[test]
    fn bitfield_bumps_scarcity_of_every_block_in_set_pieces() {
        let blocks_per_piece = vec![2, 2, 2, 2];
        let mut blocks = vec![Block::new(Priority::Normal); 8];
        let mut bits = Bitfield::new();
        bits.resize(4, false);
        bits.set(0, true);

        apply_bitfield(&mut blocks, &blocks_per_piece, &bits);
        assert_eq!(blocks[0].scarcity, 1);
        assert_eq!(blocks[1].scarcity, 1);
        assert_eq!(blocks[2].scarcity, 0);
    }

    #[test]
    fn have_scarcity_scenario_matches_three_peers() {
        // 4 pieces of 2 blocks each; 3 peers send HAVE(0), HAVE(0), HAVE(2).
        let blocks_per_piece = vec![2, 2, 2, 2];
        let mut blocks = vec![Block::new(Priority::Normal); 8];

        apply_have(&mut blocks, &blocks_per_piece, 0);
        apply_have(&mut blocks, &blocks_per_piece, 0);
        apply_have(&mut blocks, &blocks_per_piece, 2);

        assert_eq!(blocks[0].scarcity, 2);
        assert_eq!(blocks[1].scarcity, 2);
        assert_eq!(blocks[2].scarcity, 0);
        assert_eq!(blocks[3].scarcity, 0);
        assert_eq!(blocks[4].scarcity, 1);
        assert_eq!(blocks[5].scarcity, 1);
        assert_eq!(blocks[6].scarcity, 0);
        assert_eq!(blocks[7].scarcity, 0);
    }
}
