use crate::market::types::{BookSide, OrderBookSnapshot, PriceLevel, Spread};

/// Distance between the best ask and the best bid, also as a percentage of
/// the best ask. `None` while either side is empty.
pub fn compute_spread(book: &OrderBookSnapshot) -> Option<Spread> {
    let best_bid = book.best_bid()?.price;
    let best_ask = book.best_ask()?.price;
    if best_ask <= 0.0 {
        return None;
    }

    let value = best_ask - best_bid;
    Some(Spread {
        value,
        percentage: value / best_ask * 100.0,
    })
}

const BUCKET_EPSILON: f64 = 1e-9;

fn bucket_index(price: f64, grouping: f64, side: BookSide) -> i64 {
    let ratio = price / grouping;
    let nearest = ratio.round();
    let index = if (ratio - nearest).abs() < BUCKET_EPSILON {
        nearest
    } else {
        match side {
            BookSide::Bid => ratio.floor(),
            BookSide::Ask => ratio.ceil(),
        }
    };
    index.clamp(i64::MIN as f64, i64::MAX as f64) as i64
}

/// Merges levels into buckets of `grouping` price units. Bids round down,
/// asks round up. A price already on a step keeps its own bucket.
pub fn group_levels(levels: &[PriceLevel], grouping: f64, side: BookSide) -> Vec<PriceLevel> {
    if !grouping.is_finite() || grouping <= 0.0 {
        return levels.to_vec();
    }

    let mut grouped: Vec<(i64, PriceLevel)> = Vec::with_capacity(levels.len());
    for level in levels {
        let bucket = bucket_index(level.price, grouping, side);

        match grouped.last_mut() {
            Some((last_bucket, merged)) if *last_bucket == bucket => {
                merged.size += level.size;
                merged.orders = merged.orders.saturating_add(level.orders);
            }
            _ => grouped.push((
                bucket,
                PriceLevel {
                    price: bucket as f64 * grouping,
                    size: level.size,
                    orders: level.orders,
                },
            )),
        }
    }

    grouped.into_iter().map(|(_, level)| level).collect()
}

pub fn group_book(book: &OrderBookSnapshot, grouping: f64) -> OrderBookSnapshot {
    OrderBookSnapshot {
        coin: book.coin.clone(),
        time_ms: book.time_ms,
        bids: group_levels(&book.bids, grouping, BookSide::Bid),
        asks: group_levels(&book.asks, grouping, BookSide::Ask),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, size: f64) -> PriceLevel {
        PriceLevel {
            price,
            size,
            orders: 1,
        }
    }

    fn book(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> OrderBookSnapshot {
        OrderBookSnapshot::new("BTC".to_string(), 0, bids, asks)
    }

    #[test]
    fn derives_spread_from_top_of_book() {
        let snapshot = book(
            vec![level(100.0, 1.0), level(99.0, 1.0)],
            vec![level(100.5, 1.0), level(101.0, 1.0)],
        );

        let spread = compute_spread(&snapshot).expect("both sides present");
        assert!((spread.value - 0.5).abs() < 1e-9);
        assert!((spread.percentage - 0.4975).abs() < 1e-4);
    }

    #[test]
    fn spread_is_absent_when_a_side_is_empty() {
        assert!(compute_spread(&book(vec![level(100.0, 1.0)], Vec::new())).is_none());
        assert!(compute_spread(&book(Vec::new(), vec![level(100.5, 1.0)])).is_none());
        assert!(compute_spread(&OrderBookSnapshot::default()).is_none());
    }

    #[test]
    fn groups_bids_down_and_asks_up() {
        let snapshot = book(
            vec![level(100.7, 1.0), level(100.2, 2.0), level(99.9, 0.5)],
            vec![level(101.1, 1.0), level(101.8, 3.0), level(102.4, 1.0)],
        );

        let grouped = group_book(&snapshot, 1.0);

        assert_eq!(grouped.bids.len(), 2);
        assert_eq!(grouped.bids[0].price, 100.0);
        assert!((grouped.bids[0].size - 3.0).abs() < 1e-9);
        assert_eq!(grouped.bids[0].orders, 2);
        assert_eq!(grouped.bids[1].price, 99.0);

        assert_eq!(grouped.asks.len(), 2);
        assert_eq!(grouped.asks[0].price, 102.0);
        assert!((grouped.asks[0].size - 4.0).abs() < 1e-9);
        assert_eq!(grouped.asks[1].price, 103.0);
    }

    #[test]
    fn prices_on_a_decimal_step_keep_their_bucket() {
        let bids = group_levels(&[level(0.3, 1.0)], 0.1, BookSide::Bid);
        assert!((bids[0].price - 0.3).abs() < 1e-9, "bid went to {}", bids[0].price);

        let asks = group_levels(&[level(0.7, 1.0)], 0.1, BookSide::Ask);
        assert!((asks[0].price - 0.7).abs() < 1e-9, "ask went to {}", asks[0].price);

        let asks = group_levels(&[level(100.03, 1.0), level(100.04, 2.0)], 0.01, BookSide::Ask);
        assert_eq!(asks.len(), 2);
        assert!((asks[0].price - 100.03).abs() < 1e-9);

        let bids = group_levels(&[level(0.35, 1.0)], 0.1, BookSide::Bid);
        assert!((bids[0].price - 0.3).abs() < 1e-9);
    }

    #[test]
    fn extreme_ratios_do_not_wrap() {
        let asks = group_levels(&[level(f64::MAX, 1.0)], 1e-300, BookSide::Ask);
        assert_eq!(asks.len(), 1);
        assert!(asks[0].price > 0.0);
    }

    #[test]
    fn invalid_grouping_leaves_levels_untouched() {
        let levels = vec![level(100.7, 1.0), level(100.2, 2.0)];
        assert_eq!(group_levels(&levels, 0.0, BookSide::Bid), levels);
    }
}
