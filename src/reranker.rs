use rayon::prelude::*;

use crate::{
    binary::{self, BinaryPatches},
    embedding::EmbeddingMatrix,
    error::{Error, Result},
    schema::RankProfile,
};

/// Late-interaction score of float query tokens against stored sign bits.
///
/// For each query token, take the best-matching patch; sum over tokens.
/// A page without patches scores 0.
pub fn score(
    profile: RankProfile,
    query: &EmbeddingMatrix,
    patches: &BinaryPatches,
) -> Result<f32> {
    if query.dimension != patches.dimension() {
        return Err(Error::Embedding(format!(
            "query tokens have {} dimensions but stored patches have {}",
            query.dimension,
            patches.dimension()
        )));
    }
    Ok(match profile {
        RankProfile::Default => maxsim_unpacked(query, patches),
        RankProfile::Hamming => maxsim_hamming(query, patches),
    })
}

/// `sum_q max_p dot(q, unpack_bits(p))`: a query component counts when the
/// matching patch bit is set.
pub fn maxsim_unpacked(query: &EmbeddingMatrix, patches: &BinaryPatches) -> f32 {
    query
        .iter_rows()
        .map(|q| {
            patches
                .iter_patches()
                .map(|p| {
                    q.iter()
                        .enumerate()
                        .filter(|&(i, _)| binary::bit_is_set(p, i))
                        .map(|(_, v)| v)
                        .sum::<f32>()
                })
                .reduce(f32::max)
                .unwrap_or(0.0)
        })
        .sum()
}

/// `sum_q max_p (1 - hamming(sign(q), p) / dim)`.
pub fn maxsim_hamming(query: &EmbeddingMatrix, patches: &BinaryPatches) -> f32 {
    let dim = patches.dimension().max(1) as f32;
    query
        .iter_rows()
        .map(|q| {
            let qb = binary::pack_bits(q);
            patches
                .iter_patches()
                .map(|p| 1.0 - binary::hamming(&qb, p) as f32 / dim)
                .reduce(f32::max)
                .unwrap_or(0.0)
        })
        .sum()
}

/// Output of [`rank_two_phase`].
#[derive(Debug)]
pub struct TwoPhase<T> {
    /// Final order, best first, with the score each item is reported with.
    pub ranked: Vec<(T, f32)>,
    /// How many candidates went through the second phase.
    pub rescored: usize,
}

/// Rescore the best `rerank_count` first-phase candidates and order them.
///
/// `candidates` must be in first-phase order, best first. The head is
/// rescored in parallel with `second_phase`; a `None` score drops the
/// candidate (no stored patches). Rescored items are sorted by descending
/// score with ties kept in first-phase order. Candidates past the depth
/// keep their first-phase order below every rescored item; their scores are
/// shifted down when needed so the whole list stays in descending order.
pub fn rank_two_phase<T, F>(
    candidates: Vec<(T, f32)>,
    rerank_count: usize,
    second_phase: F,
) -> Result<TwoPhase<T>>
where
    T: Send + Sync,
    F: Fn(&T) -> Result<Option<f32>> + Sync,
{
    let depth = rerank_count.min(candidates.len());
    let mut candidates = candidates;
    let tail = candidates.split_off(depth);

    let scores: Vec<Option<f32>> = candidates
        .par_iter()
        .map(|(item, _)| second_phase(item))
        .collect::<Result<_>>()?;

    let mut ranked: Vec<(T, f32)> = candidates
        .into_iter()
        .zip(scores)
        .filter_map(|((item, _), score)| score.map(|s| (item, s)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let lowest = ranked.last().map(|(_, s)| *s);
    let highest_tail = tail.first().map(|(_, s)| *s);
    let shift = match (lowest, highest_tail) {
        (Some(low), Some(high)) => (low - high).min(0.0),
        _ => 0.0,
    };
    ranked.extend(tail.into_iter().map(|(item, s)| (item, s + shift)));

    Ok(TwoPhase {
        ranked,
        rescored: depth,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    fn query(rows: Vec<Vec<f32>>) -> EmbeddingMatrix {
        EmbeddingMatrix::from_rows(rows).unwrap()
    }

    fn patches(bytes: &[u8]) -> BinaryPatches {
        BinaryPatches::from_packed(bytes.len() as u32, 8, bytes.to_vec())
            .unwrap()
    }

    #[test]
    fn unpacked_sums_components_on_set_bits() {
        let q = query(vec![vec![0.5, 0.25, -1.0, 0.0, 0.0, 0.0, 0.0, 2.0]]);
        // Patch 0 selects components 0 and 2; patch 1 selects 0, 1 and 7.
        let p = patches(&[0b1010_0000, 0b1100_0001]);
        let s = maxsim_unpacked(&q, &p);
        assert!((s - 2.75).abs() < 1e-6);
    }

    #[test]
    fn unpacked_sums_over_query_tokens() {
        let q = query(vec![
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ]);
        let p = patches(&[0b1000_0000, 0b0100_0000]);
        assert!((maxsim_unpacked(&q, &p) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn hamming_is_one_for_identical_signs() {
        let q = query(vec![vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0]]);
        let p = patches(&[0b1010_1010, 0b0101_0101]);
        assert!((maxsim_hamming(&q, &p) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn no_patches_scores_zero() {
        let q = query(vec![vec![1.0; 8]]);
        let p = BinaryPatches::from_packed(0, 8, vec![]).unwrap();
        assert_eq!(maxsim_unpacked(&q, &p), 0.0);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let q = query(vec![vec![1.0; 16]]);
        assert!(score(RankProfile::Default, &q, &patches(&[0xFF])).is_err());
    }

    #[test]
    fn rescored_items_sorted_descending_with_stable_ties() {
        let candidates = vec![("a", 9.0), ("b", 8.0), ("c", 7.0), ("d", 6.0)];
        let second = |item: &&str| {
            Ok(Some(match *item {
                "a" => 1.0,
                "b" => 3.0,
                "c" => 3.0,
                _ => 2.0,
            }))
        };
        let out = rank_two_phase(candidates, 100, second).unwrap();
        let order: Vec<_> = out.ranked.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec!["b", "c", "d", "a"]);
        assert_eq!(out.rescored, 4);
    }

    #[test]
    fn rescoring_stops_at_depth() {
        let calls = AtomicUsize::new(0);
        let candidates: Vec<_> =
            (0..10).map(|i| (i, 100.0 - i as f32)).collect();
        let out = rank_two_phase(candidates, 3, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(1000.0))
        })
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.rescored, 3);
        assert_eq!(out.ranked.len(), 10);
        let tail: Vec<_> = out.ranked[3..].iter().map(|(i, _)| *i).collect();
        assert_eq!(tail, (3..10).collect::<Vec<_>>());
    }

    #[test]
    fn tail_is_shifted_below_rescored() {
        // Second-phase scores are far below first-phase ones.
        let candidates = vec![(0, 50.0), (1, 40.0), (2, 30.0), (3, 20.0)];
        let out = rank_two_phase(candidates, 2, |i| Ok(Some(*i as f32))).unwrap();

        let ids: Vec<_> = out.ranked.iter().map(|(i, _)| *i).collect();
        assert_eq!(ids, vec![1, 0, 2, 3]);
        let scores: Vec<_> = out.ranked.iter().map(|(_, s)| *s).collect();
        assert_eq!(scores, vec![1.0, 0.0, 0.0, -10.0]);
    }

    #[test]
    fn missing_patches_drop_candidate() {
        let candidates = vec![(0, 2.0), (1, 1.0)];
        let out = rank_two_phase(candidates, 10, |i| {
            Ok((*i == 1).then_some(5.0))
        })
        .unwrap();
        assert_eq!(out.ranked, vec![(1, 5.0)]);
    }

    #[test]
    fn scorer_errors_propagate() {
        let candidates = vec![(0, 2.0)];
        let err = rank_two_phase(candidates, 10, |_| {
            Err(Error::RetrievalBackend("deadline exceeded".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::RetrievalBackend(_)));
    }

    proptest! {
        #[test]
        fn output_is_descending(
            first in prop::collection::vec(-100.0f32..100.0, 0..50),
            second in prop::collection::vec(-100.0f32..100.0, 50),
            depth in 0usize..60,
        ) {
            let mut first = first;
            first.sort_by(|a, b| b.total_cmp(a));
            let candidates: Vec<_> = first.into_iter().enumerate().collect();
            let out = rank_two_phase(candidates, depth, |i| Ok(Some(second[*i]))).unwrap();
            for w in out.ranked.windows(2) {
                prop_assert!(w[0].1 >= w[1].1);
            }
        }
    }
}
