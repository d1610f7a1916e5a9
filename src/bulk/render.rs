//! Wire rendering of collected entries.
//!
//! Every entry becomes a hextuple status line followed by its body, so a
//! client can tell which resources were found and with which status before
//! reading their statements.

use bytes::Bytes;
use futures::{Stream, TryStreamExt};

use super::engine::EngineError;
use crate::cache::CacheEntry;

pub const STATUS_CODE_PREDICATE: &str = "http://www.w3.org/2011/http#statusCode";
pub const INTEGER_DATATYPE: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const META_GRAPH: &str = "http://purl.org/link-lib/meta";

/// The hextuple announcing `entry`'s status, without trailing newline.
pub fn status_line(entry: &CacheEntry) -> String {
    serde_json::json!([
        entry.iri,
        STATUS_CODE_PREDICATE,
        entry.status.to_string(),
        INTEGER_DATATYPE,
        "",
        META_GRAPH,
    ])
    .to_string()
}

/// Status line plus body, newline terminated.
pub fn render_entry(entry: &CacheEntry) -> Bytes {
    let status = status_line(entry);
    let body = entry.contents.as_deref().unwrap_or_default();
    let mut rendered = String::with_capacity(status.len() + body.len() + 2);
    rendered.push_str(&status);
    rendered.push('\n');
    if !body.is_empty() {
        rendered.push_str(body);
        if !body.ends_with('\n') {
            rendered.push('\n');
        }
    }
    Bytes::from(rendered)
}

/// Render a stream of entries into response body chunks.
pub fn render<S>(entries: S) -> impl Stream<Item = Result<Bytes, EngineError>> + Send
where
    S: Stream<Item = Result<CacheEntry, EngineError>> + Send,
{
    entries.map_ok(|entry| render_entry(&entry))
}

#[cfg(test)]
mod tests {
    use futures::{StreamExt, stream};

    use super::*;
    use crate::cache::CacheControl;

    #[test]
    fn status_line_is_a_hextuple() {
        let entry = CacheEntry::failed("https://ex/\"quoted\"", 404);
        let parsed: Vec<String> =
            serde_json::from_str(&status_line(&entry)).expect("json array");
        assert_eq!(
            parsed,
            vec![
                "https://ex/\"quoted\"",
                STATUS_CODE_PREDICATE,
                "404",
                INTEGER_DATATYPE,
                "",
                META_GRAPH,
            ]
        );
    }

    #[test]
    fn bodies_follow_their_status_line() {
        let entry = CacheEntry::new("https://ex/1", 200, CacheControl::Public, Some("[\"a\"]".into()));
        let rendered = render_entry(&entry);
        let text = std::str::from_utf8(&rendered).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(STATUS_CODE_PREDICATE));
        assert_eq!(lines[1], "[\"a\"]");
        assert!(text.ends_with('\n'));

        let empty = render_entry(&CacheEntry::failed("https://ex/2", 403));
        assert_eq!(std::str::from_utf8(&empty).expect("utf8").lines().count(), 1);
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let entries = stream::iter(vec![
            Ok(CacheEntry::failed("https://ex/1", 404)),
            Err(EngineError::from(crate::cache::StoreError::unavailable("down"))),
        ]);
        let chunks: Vec<Result<Bytes, EngineError>> = render(entries).collect().await;
        assert!(chunks[0].is_ok());
        assert!(chunks[1].is_err());
    }
}
