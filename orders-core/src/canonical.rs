//! 冪等性キー用の正規化リクエストダイジェスト
//!
//! 「同じ注文内容」を表現違いに依らず同じ SHA-256 ダイジェストへ写す。
//! - 明細は SKU 昇順にソート（安定ソート。重複 SKU は元の順を保つ）
//! - 単価は末尾ゼロを落とした表記に正規化（10.00 / 10.0 / 10 は同一）
//! - `userId=..;currency=..;items=..` 形式の正規化文字列をハッシュ

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

/// ダイジェスト計算に必要な明細1行分のビュー
#[derive(Debug, Clone, Copy)]
pub struct CanonicalItem<'a> {
    pub sku: &'a str,
    pub qty: u32,
    pub unit_price: Decimal,
}

/// 正規化リクエストの SHA-256 を小文字 hex（64文字）で返す。
pub fn request_hash(user_id: &str, currency: &str, items: &[CanonicalItem<'_>]) -> String {
    let canonical = canonical_request(user_id, currency, items);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// ハッシュ対象の正規化文字列を組み立てる。
pub fn canonical_request(user_id: &str, currency: &str, items: &[CanonicalItem<'_>]) -> String {
    let mut sorted: Vec<&CanonicalItem<'_>> = items.iter().collect();
    sorted.sort_by(|a, b| a.sku.cmp(b.sku));

    let items_part = sorted
        .iter()
        .map(|item| format!("{},{},{}", item.sku, item.qty, plain_decimal(item.unit_price)))
        .collect::<Vec<_>>()
        .join("|");

    format!(
        "userId={};currency={};items={}",
        user_id, currency, items_part
    )
}

/// 末尾の小数ゼロを取り除いた表記。指数表記にはしない。
pub fn plain_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn item<'a>(sku: &'a str, qty: u32, unit_price: &str) -> CanonicalItem<'a> {
        CanonicalItem {
            sku,
            qty,
            unit_price: Decimal::from_str(unit_price).unwrap(),
        }
    }

    #[test]
    fn same_request_produces_same_hash() {
        let items = [item("SKU-A", 2, "10.00"), item("SKU-B", 1, "20.00")];
        let h1 = request_hash("u1", "USD", &items);
        let h2 = request_hash("u1", "USD", &items);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn item_order_does_not_matter() {
        let forward = [item("SKU-A", 2, "10.00"), item("SKU-B", 1, "20.00")];
        let reversed = [item("SKU-B", 1, "20.00"), item("SKU-A", 2, "10.00")];
        assert_eq!(
            request_hash("u1", "USD", &forward),
            request_hash("u1", "USD", &reversed)
        );
    }

    #[test]
    fn decimal_rendering_does_not_matter() {
        let a = [item("SKU-A", 1, "10.00")];
        let b = [item("SKU-A", 1, "10.0")];
        let c = [item("SKU-A", 1, "10")];
        let ha = request_hash("u1", "USD", &a);
        assert_eq!(ha, request_hash("u1", "USD", &b));
        assert_eq!(ha, request_hash("u1", "USD", &c));
    }

    #[test]
    fn semantic_differences_change_the_hash() {
        let base = [item("SKU-A", 1, "10.00")];
        let h = request_hash("u1", "USD", &base);
        assert_ne!(h, request_hash("u2", "USD", &base));
        assert_ne!(h, request_hash("u1", "EUR", &base));
        assert_ne!(h, request_hash("u1", "USD", &[item("SKU-A", 2, "10.00")]));
        assert_ne!(h, request_hash("u1", "USD", &[item("SKU-A", 1, "10.01")]));
        assert_ne!(h, request_hash("u1", "USD", &[item("SKU-B", 1, "10.00")]));
    }

    #[test]
    fn duplicate_skus_are_allowed() {
        let items = [item("SKU-A", 1, "5"), item("SKU-A", 2, "5")];
        // 落ちずに決定的なダイジェストになること
        assert_eq!(
            request_hash("u1", "USD", &items),
            request_hash("u1", "USD", &items)
        );
    }

    #[test]
    fn canonical_string_format() {
        let items = [item("SKU-B", 1, "20.50"), item("SKU-A", 2, "10.00")];
        assert_eq!(
            canonical_request("u1", "USD", &items),
            "userId=u1;currency=USD;items=SKU-A,2,10|SKU-B,1,20.5"
        );
    }
}
