//! Cache key definitions.
//!
//! Every store key is a flat, `:`-separated list of segments. Segments are
//! escaped before joining so IRIs (which routinely contain `:`) survive a
//! round trip through [`KeyCodec::to_key`] and [`KeyCodec::from_key`].

/// Separator between key segments, matching the store's namespace convention.
pub const KEY_SEPARATOR: char = ':';

/// Segment marking a cached resource entry.
pub const ENTRY_SEGMENT: &str = "cacheEntry";

const ESCAPE: char = '%';
const ESCAPED_ESCAPE: &str = "%25";
const ESCAPED_SEPARATOR: &str = "%3A";

/// Builds and parses store keys under a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: Vec<String>,
}

impl KeyCodec {
    /// Create a codec whose keys all start with the given prefix segments.
    pub fn new<I, S>(prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: prefix.into_iter().map(Into::into).collect(),
        }
    }

    /// Prefix segments shared by all keys produced by this codec.
    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    /// Key of the cached entry for `iri` in `lang`.
    pub fn entry_key(&self, iri: &str, lang: &str) -> String {
        let parts = self
            .prefix
            .iter()
            .map(String::as_str)
            .chain([ENTRY_SEGMENT, iri, lang]);
        Self::to_key(parts)
    }

    /// Inverse of [`entry_key`](Self::entry_key).
    ///
    /// Returns `None` for keys this codec did not produce.
    pub fn from_entry_key(&self, key: &str) -> Option<(String, String)> {
        let mut parts = Self::from_key(key);
        if parts.len() != self.prefix.len() + 3 || parts[..self.prefix.len()] != self.prefix[..] {
            return None;
        }
        let lang = parts.pop()?;
        let iri = parts.pop()?;
        (parts.pop()? == ENTRY_SEGMENT).then_some((iri, lang))
    }

    /// Glob pattern matching every entry key under this prefix.
    pub fn entry_pattern(&self) -> String {
        let base = Self::to_key(
            self.prefix
                .iter()
                .map(String::as_str)
                .chain([ENTRY_SEGMENT]),
        );
        format!("{base}{KEY_SEPARATOR}*")
    }

    /// Join escaped segments into a single key.
    pub fn to_key<'a, I>(parts: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut key = String::new();
        for (index, part) in parts.into_iter().enumerate() {
            if index > 0 {
                key.push(KEY_SEPARATOR);
            }
            escape_into(part, &mut key);
        }
        key
    }

    /// Split a key into its unescaped segments.
    pub fn from_key(key: &str) -> Vec<String> {
        key.split(KEY_SEPARATOR).map(unescape).collect()
    }
}

fn escape_into(segment: &str, out: &mut String) {
    for ch in segment.chars() {
        match ch {
            ESCAPE => out.push_str(ESCAPED_ESCAPE),
            KEY_SEPARATOR => out.push_str(ESCAPED_SEPARATOR),
            other => out.push(other),
        }
    }
}

fn unescape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(pos) = rest.find(ESCAPE) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with(ESCAPED_ESCAPE) {
            out.push(ESCAPE);
            rest = &tail[ESCAPED_ESCAPE.len()..];
        } else if tail.starts_with(ESCAPED_SEPARATOR) {
            out.push(KEY_SEPARATOR);
            rest = &tail[ESCAPED_SEPARATOR.len()..];
        } else {
            out.push(ESCAPE);
            rest = &tail[ESCAPE.len_utf8()..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> KeyCodec {
        KeyCodec::new(["cache"])
    }

    #[test]
    fn entry_key_escapes_separator() {
        let key = codec().entry_key("https://example.com/a:b", "en");
        assert_eq!(key, "cache:cacheEntry:https%3A//example.com/a%3Ab:en");
    }

    #[test]
    fn entry_key_round_trips() {
        let codec = codec();
        for iri in [
            "https://example.com/1",
            "https://example.com/%3A/literal",
            "urn:isbn:0451450523",
            "https://example.com/100%25",
            "",
        ] {
            for lang in ["en", "nl", "zh:hans"] {
                let key = codec.entry_key(iri, lang);
                assert_eq!(
                    codec.from_entry_key(&key),
                    Some((iri.to_string(), lang.to_string())),
                    "key `{key}` did not round trip"
                );
            }
        }
    }

    #[test]
    fn from_entry_key_rejects_foreign_keys() {
        let codec = codec();
        assert_eq!(codec.from_entry_key("other:cacheEntry:x:en"), None);
        assert_eq!(codec.from_entry_key("cache:somethingElse:x:en"), None);
        assert_eq!(codec.from_entry_key("cache:cacheEntry:x"), None);
    }

    #[test]
    fn multi_segment_prefix() {
        let codec = KeyCodec::new(["tenant:a", "cache"]);
        let key = codec.entry_key("https://ex/1", "de");
        assert!(key.starts_with("tenant%3Aa:cache:cacheEntry:"));
        assert_eq!(
            codec.from_entry_key(&key),
            Some(("https://ex/1".to_string(), "de".to_string()))
        );
    }

    #[test]
    fn generic_keys_round_trip() {
        let parts = ["a:b", "%", "", "plain"];
        let key = KeyCodec::to_key(parts);
        assert_eq!(KeyCodec::from_key(&key), parts.to_vec());
    }

    #[test]
    fn entry_pattern_covers_entry_keys() {
        assert_eq!(codec().entry_pattern(), "cache:cacheEntry:*");
    }
}
