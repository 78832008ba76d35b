//! Newznab protocol layer: wire format, upstream client, and HTTP surface.

pub mod client;
pub mod server;
pub mod wire;

/// Parameters of a `t=search` request, minus transport concerns (`t` and
/// `apikey` are supplied by the client/server layers).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParams {
    pub query: String,
    pub category: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub output: Option<String>,
    pub attrs: Option<String>,
    pub extended: Option<String>,
    pub del: Option<String>,
    pub max_age: Option<u32>,
    pub group: Option<String>,
}

impl SearchParams {
    /// Replace the query with its sanitised form (see [`sanitise_query`]).
    pub fn with_sanitised_query(mut self) -> Self {
        self.query = sanitise_query(&self.query);
        self
    }

    /// Encode the parameters as URL query pairs, omitting unset fields.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("q", self.query.clone())];
        if let Some(v) = &self.category {
            pairs.push(("cat", v.clone()));
        }
        if let Some(v) = self.limit {
            pairs.push(("limit", v.to_string()));
        }
        if let Some(v) = self.offset {
            pairs.push(("offset", v.to_string()));
        }
        if let Some(v) = &self.output {
            pairs.push(("o", v.clone()));
        }
        if let Some(v) = &self.attrs {
            pairs.push(("attrs", v.clone()));
        }
        if let Some(v) = &self.extended {
            pairs.push(("extended", v.clone()));
        }
        if let Some(v) = &self.del {
            pairs.push(("del", v.clone()));
        }
        if let Some(v) = self.max_age {
            pairs.push(("maxage", v.to_string()));
        }
        if let Some(v) = &self.group {
            pairs.push(("group", v.clone()));
        }
        pairs
    }
}

/// Canonical form of a search query used for cache keys and fan-out:
/// surrounding whitespace trimmed, internal whitespace collapsed to single
/// spaces, lowercased.
pub fn sanitise_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
