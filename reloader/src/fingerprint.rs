use std::fmt;

use sha2::{Digest, Sha256};

/// Separator between keys, values and entries in the canonical form.
const SEP: [u8; 1] = [0x00];

/// SHA-256 over the data section of a configuration object.
///
/// Metadata never contributes, so label or annotation churn on a resource
/// can not look like a content change.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hash a set of key/value entries.
    ///
    /// Entries are canonicalized by sorting on the key, so the insertion
    /// order of the input never matters. Values are hashed byte-verbatim.
    pub fn of_pairs<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut entries: Vec<(&str, &[u8])> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for (key, value) in entries {
            hasher.update(key.as_bytes());
            hasher.update(SEP);
            hasher.update(value);
            hasher.update(SEP);
        }
        Fingerprint(hasher.finalize().into())
    }

    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first 8 bytes are plenty for log correlation
        write!(f, "Fingerprint({}..)", &self.hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_input_order() {
        let a = Fingerprint::of_pairs([("k1", b"v1".as_slice()), ("k2", b"v2".as_slice())]);
        let b = Fingerprint::of_pairs([("k2", b"v2".as_slice()), ("k1", b"v1".as_slice())]);
        assert_eq!(a, b);
    }

    #[test]
    fn value_change_is_detected() {
        let a = Fingerprint::of_pairs([("k", b"v1".as_slice())]);
        let b = Fingerprint::of_pairs([("k", b"v2".as_slice())]);
        assert_ne!(a, b);
    }

    #[test]
    fn key_and_value_do_not_collapse() {
        // "ab" => "c" must differ from "a" => "bc"
        let a = Fingerprint::of_pairs([("ab", b"c".as_slice())]);
        let b = Fingerprint::of_pairs([("a", b"bc".as_slice())]);
        assert_ne!(a, b);
    }

    #[test]
    fn entry_boundaries_do_not_collapse() {
        let a = Fingerprint::of_pairs([("a", b"1".as_slice()), ("b", b"2".as_slice())]);
        let b = Fingerprint::of_pairs([("a", b"1\x00b\x002".as_slice())]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_input_is_stable() {
        let a = Fingerprint::of_pairs(std::iter::empty::<(&str, &[u8])>());
        let b = Fingerprint::of_pairs(std::iter::empty::<(&str, &[u8])>());
        assert_eq!(a, b);
    }

    #[test]
    fn hex_is_lowercase_sha256_width() {
        let fp = Fingerprint::of_pairs([("k", b"v".as_slice())]);
        let hex = fp.hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(format!("{fp}"), hex);
    }
}
