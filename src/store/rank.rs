//! FTS4 `matchinfo()` decoding and the rank-score formula (§4.A.1).
//!
//! `sqlx` has no ergonomic way to register a SQLite scalar function the
//! way `rusqlite`'s `create_function` does, so the `matchinfo('pcx')`
//! BLOB is projected as an extra query column and decoded here, in Rust,
//! instead of inside SQLite. See DESIGN.md for why.

/// Column weights for `title`, `artist`, `album`, in that schema order.
pub const COLUMN_WEIGHTS: [f64; 3] = [1.0, 0.5, 0.75];

/// Compute the rank score for one row from its `matchinfo('pcx')` BLOB.
///
/// Layout per the FTS4 documentation: a `u32` header `(p, c)` — phrase
/// count and column count — followed by `p * c` triples of `u32`
/// `(hits_this_row, hits_all_rows, docs_with_a_hit)`, all native-endian.
/// The score sums, over every phrase and column, `weight[col] *
/// hits_this_row / hits_all_rows` wherever `hits_all_rows > 0`.
pub fn score_from_matchinfo(blob: &[u8]) -> f64 {
    if blob.len() < 8 {
        return 0.0;
    }
    let read_u32 = |word_index: usize| -> Option<u32> {
        let start = word_index * 4;
        blob.get(start..start + 4)
            .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
    };
    let Some(nphrase) = read_u32(0) else {
        return 0.0;
    };
    let Some(ncol) = read_u32(1) else {
        return 0.0;
    };
    let (nphrase, ncol) = (nphrase as usize, ncol as usize);

    let mut score = 0.0;
    for phrase in 0..nphrase {
        for col in 0..ncol.min(COLUMN_WEIGHTS.len()) {
            let base_word = 2 + (phrase * ncol + col) * 3;
            let (Some(hits_row), Some(hits_all)) = (read_u32(base_word), read_u32(base_word + 1))
            else {
                continue;
            };
            if hits_all > 0 {
                score += COLUMN_WEIGHTS[col] * (hits_row as f64 / hits_all as f64);
            }
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a synthetic `matchinfo('pcx')` blob for one phrase over the
    /// three `(title, artist, album)` columns.
    fn make_matchinfo(per_column_this_row: [u32; 3], per_column_all_rows: [u32; 3]) -> Vec<u8> {
        let mut words = vec![1u32, 3u32]; // 1 phrase, 3 columns
        for col in 0..3 {
            words.push(per_column_this_row[col]);
            words.push(per_column_all_rows[col]);
            words.push(0); // docs-with-a-hit, unused by the formula
        }
        words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }

    #[test]
    fn title_match_outranks_album_match() {
        let title_hit = make_matchinfo([1, 0, 0], [1, 0, 0]);
        let album_hit = make_matchinfo([0, 0, 1], [0, 0, 1]);
        assert!(score_from_matchinfo(&title_hit) > score_from_matchinfo(&album_hit));
    }

    #[test]
    fn album_match_outranks_artist_match() {
        let album_hit = make_matchinfo([0, 0, 1], [0, 0, 1]);
        let artist_hit = make_matchinfo([0, 1, 0], [0, 1, 0]);
        assert!(score_from_matchinfo(&album_hit) > score_from_matchinfo(&artist_hit));
    }

    #[test]
    fn zero_global_hits_contributes_nothing() {
        let blob = make_matchinfo([1, 0, 0], [0, 0, 0]);
        assert_eq!(score_from_matchinfo(&blob), 0.0);
    }

    #[test]
    fn matches_in_all_three_columns_beat_a_single_column() {
        let all_three = make_matchinfo([1, 1, 1], [1, 1, 1]);
        let title_only = make_matchinfo([1, 0, 0], [1, 0, 0]);
        assert!(score_from_matchinfo(&all_three) > score_from_matchinfo(&title_only));
    }

    #[test]
    fn short_blob_scores_zero() {
        assert_eq!(score_from_matchinfo(&[1, 2, 3]), 0.0);
    }
}
