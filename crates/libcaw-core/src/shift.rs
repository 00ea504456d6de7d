//! Line marker shifting
//!
//! Markers are line numbers recorded against an older state of a document.
//! Each [`EditBlock`] describes one mutation in the coordinates of the
//! document as left by the previous block, so blocks are applied in order
//! to the already-shifted values.

use std::collections::BTreeSet;

use crate::types::edit::EditBlock;

/// Shift `lines` across `edits`, returning the surviving markers ascending.
///
/// For each block, every line past `range.line` moves by
/// `replace_len - range.len`, clamped to `range.line` so markers inside a
/// deleted region collapse onto the block start. Collapsed markers are
/// merged, so the result never grows.
pub fn shift_lines(lines: &[u32], edits: &[EditBlock]) -> Vec<u32> {
    let mut current: Vec<u32> = lines.iter().copied().filter(|&l| l >= 1).collect();

    for block in edits {
        shift_block(&mut current, block);
    }

    let unique: BTreeSet<u32> = current.into_iter().collect();
    unique.into_iter().collect()
}

fn shift_block(lines: &mut [u32], block: &EditBlock) {
    let start = block.range.line;
    let delta = block.delta();
    if delta == 0 {
        return;
    }

    for line in lines.iter_mut() {
        if *line > start {
            let moved = (i64::from(*line) + delta).max(i64::from(start)).max(1);
            // moved <= line + replace_len, which fits u32 for any real document
            *line = u32::try_from(moved).unwrap_or(u32::MAX);
        }
    }
}
