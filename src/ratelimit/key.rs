//! Rate key handling. Keys are opaque strings produced by the limiter's key
//! resolver; shared backends store them under a prefix.

/// Join a backend prefix and a key.
pub fn namespaced(prefix: &str, key: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + key.len());
    out.push_str(prefix);
    out.push_str(key);
    out
}
