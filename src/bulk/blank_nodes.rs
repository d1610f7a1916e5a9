//! Blank-node scoping for concatenated resource bodies.
//!
//! Backends mint blank-node labels (`"_:b0"`) per response, so two bodies
//! written into one stream may reuse a label for different nodes. Each body
//! gets a fresh scope that is spliced into every label it contains.

use uuid::Uuid;

const LABEL_START: &str = "\"_:";

/// A fresh scope, unique per call.
pub fn new_scope() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Prefix every quoted blank-node label in `body` with `scope`.
///
/// Escaped quotes (`\"_:`) belong to literal values and are left alone.
pub fn scope_blank_nodes(body: &str, scope: &str) -> String {
    let mut scoped = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(at) = rest.find(LABEL_START) {
        let (before, after) = rest.split_at(at);
        scoped.push_str(before);
        scoped.push_str(LABEL_START);
        if !before.ends_with('\\') {
            scoped.push_str(scope);
        }
        rest = &after[LABEL_START.len()..];
    }
    scoped.push_str(rest);
    scoped
}
