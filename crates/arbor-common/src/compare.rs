//! Key ordering.
//!
//! Trees order keys through a [`KeyComparer`] rather than `Ord`, so a tree of
//! strings can be case-insensitive without a newtype. An [`AlternateComparer`]
//! compares a borrowed probe against stored keys, which lets a `String` tree be
//! searched with a `&str`.

use std::cmp::Ordering;

/// Total order over keys.
pub trait KeyComparer<K: ?Sized>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders a probe of type `A` against stored keys of type `K`.
pub trait AlternateComparer<A: ?Sized, K>: Send + Sync {
    fn compare(&self, probe: &A, key: &K) -> Ordering;
}

/// Natural `Ord` order.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparer;

impl<K: Ord + ?Sized> KeyComparer<K> for OrdComparer {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

impl AlternateComparer<[u8], Vec<u8>> for OrdComparer {
    #[inline]
    fn compare(&self, probe: &[u8], key: &Vec<u8>) -> Ordering {
        probe.cmp(key.as_slice())
    }
}

/// Byte-wise string order.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringOrdinal;

impl KeyComparer<String> for StringOrdinal {
    #[inline]
    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.as_bytes().cmp(b.as_bytes())
    }
}

impl AlternateComparer<str, String> for StringOrdinal {
    #[inline]
    fn compare(&self, probe: &str, key: &String) -> Ordering {
        probe.as_bytes().cmp(key.as_bytes())
    }
}

/// String order ignoring case.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringOrdinalIgnoreCase;

fn compare_ignore_case(a: &str, b: &str) -> Ordering {
    let left = a.chars().flat_map(char::to_uppercase);
    let right = b.chars().flat_map(char::to_uppercase);
    left.cmp(right)
}

impl KeyComparer<String> for StringOrdinalIgnoreCase {
    fn compare(&self, a: &String, b: &String) -> Ordering {
        compare_ignore_case(a, b)
    }
}

impl AlternateComparer<str, String> for StringOrdinalIgnoreCase {
    fn compare(&self, probe: &str, key: &String) -> Ordering {
        compare_ignore_case(probe, key)
    }
}

/// Reverses another comparer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reverse<C>(pub C);

impl<K: ?Sized, C: KeyComparer<K>> KeyComparer<K> for Reverse<C> {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self.0.compare(b, a)
    }
}

/// Adapts a closure into a comparer.
#[derive(Clone, Copy)]
pub struct FnComparer<F>(pub F);

impl<K: ?Sized, F> KeyComparer<K> for FnComparer<F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}
