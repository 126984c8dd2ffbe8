//! Orders Core - admission-control primitives for the order gateway
//!
//! This library provides the pure building blocks shared by every
//! gateway backend:
//! - Token-bucket arithmetic (token_bucket.rs)
//! - Canonical request digest for idempotency (canonical.rs)
//!
//! No async runtime, no I/O: every function here is deterministic given
//! its inputs, so the service crate can test backends against it.

pub mod canonical;
pub mod token_bucket;

pub use canonical::{plain_decimal, request_hash, CanonicalItem};
pub use token_bucket::{initial_state, refill_and_consume, BucketState, TokenBucketDecision};

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn test_admission_primitives_integration() {
        // 同じ注文内容 → 同じダイジェスト
        let items = [CanonicalItem {
            sku: "SKU-A",
            qty: 2,
            unit_price: Decimal::from_str("10.00").unwrap(),
        }];
        let h1 = request_hash("u1", "USD", &items);
        let h2 = request_hash("u1", "USD", &items);
        assert_eq!(h1, h2);

        // バケットは capacity 分のバーストを許容する
        let mut state = initial_state(2, 0);
        assert!(matches!(
            refill_and_consume(&mut state, 0, 2, 1.0),
            TokenBucketDecision::Allowed
        ));
        assert!(matches!(
            refill_and_consume(&mut state, 0, 2, 1.0),
            TokenBucketDecision::Allowed
        ));
        assert!(matches!(
            refill_and_consume(&mut state, 0, 2, 1.0),
            TokenBucketDecision::Rejected { .. }
        ));
    }
}
