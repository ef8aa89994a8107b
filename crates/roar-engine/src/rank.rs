use std::cmp::Ordering;

use roar_core::ScoredOffer;

fn compare(a: &ScoredOffer, b: &ScoredOffer) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.sub_scores.source.total_cmp(&a.sub_scores.source))
        .then_with(|| b.offer.fare_minor.cmp(&a.offer.fare_minor))
}

/// Best first: score, then source desirability, then fare. Equal keys keep input order.
pub fn rank(mut scored: Vec<ScoredOffer>, max_results: usize) -> Vec<ScoredOffer> {
    scored.sort_by(compare);
    scored.truncate(max_results);
    scored
}
