#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
use prop::string::string_regex;
use proptest::prelude::*;
use proptest::{collection::vec, strategy::Strategy};

/// A small key space so generated operations collide often.
pub fn cache_keys() -> impl Strategy<Value = String> {
    (0u8..8).prop_map(|i| format!("k{i}"))
}

#[derive(Debug, Clone)]
pub enum LruOp {
    Set(String, u32),
    Get(String),
    Delete(String),
}

pub fn lru_op() -> impl Strategy<Value = LruOp> {
    prop_oneof![
        3 => (cache_keys(), any::<u32>()).prop_map(|(key, value)| LruOp::Set(key, value)),
        3 => cache_keys().prop_map(LruOp::Get),
        1 => cache_keys().prop_map(LruOp::Delete),
    ]
}

pub fn lru_ops() -> impl Strategy<Value = Vec<LruOp>> {
    vec(lru_op(), 0..64)
}

/// Kind names as a user might type them, padded with whitespace and in any case.
pub fn typed_kinds() -> impl Strategy<Value = String> {
    let known = prop_oneof![
        Just("po"),
        Just("pods"),
        Just("Pod"),
        Just("deploy"),
        Just("svc"),
        Just("ConfigMap"),
        Just("ns"),
        Just("crd"),
    ]
    .prop_map(str::to_string);
    let unknown = string_regex("[A-Za-z][A-Za-z0-9]{0,12}").expect("invalid regex");
    (prop_oneof![known, unknown], 0usize..3, 0usize..3).prop_map(|(kind, left, right)| {
        format!("{}{kind}{}", " ".repeat(left), " ".repeat(right))
    })
}
