use ::url::{form_urlencoded, Position, Url};
use serde_json::json;

use crate::values::TestValue;

/// A mutated url and the context naming what changed.
#[derive(Debug, Clone)]
pub struct UrlMutation {
    pub url: String,
    pub context: String,
}

/// The serialized pieces of a parsed url. Mutated urls are spliced together
/// from these so untouched parts keep their exact bytes and dot segments in
/// a test value are not resolved away.
struct UrlParts<'a> {
    origin: &'a str,
    path: &'a str,
    query: Option<&'a str>,
    fragment: Option<&'a str>,
}

impl<'a> UrlParts<'a> {
    fn of(url: &'a Url) -> Self {
        Self {
            origin: &url[..Position::BeforePath],
            path: url.path(),
            query: url.query(),
            fragment: url.fragment(),
        }
    }

    fn assemble(&self, path: &str, query: Option<&str>) -> String {
        let mut out = String::from(self.origin);
        out.push_str(path);
        if let Some(query) = query {
            out.push('?');
            out.push_str(query);
        }
        if let Some(fragment) = self.fragment {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

/// `?` and `#` would move the rest of the value out of the path.
fn path_segment(value: &str) -> String {
    value.replace('?', "%3F").replace('#', "%23")
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// One test per path segment: the segment replaced by the test value, or
/// deleted for REMOVE. A path without any non-empty segment yields nothing.
pub fn path_mutations(base: &Url, value: &TestValue) -> Vec<UrlMutation> {
    if base.cannot_be_a_base() {
        return Vec::new();
    }
    let parts = UrlParts::of(base);
    let raw = parts.path.strip_prefix('/').unwrap_or(parts.path);
    let segments: Vec<&str> = raw.split('/').collect();
    if segments.iter().all(|s| s.is_empty()) {
        return Vec::new();
    }

    let replacement = path_segment(&value.value);
    let mut out = Vec::with_capacity(segments.len());
    for (index, segment) in segments.iter().enumerate() {
        let mut mutated = segments.clone();
        if value.test_type.is_remove() {
            mutated.remove(index);
        } else {
            mutated[index] = replacement.as_str();
        }
        out.push(UrlMutation {
            url: parts.assemble(&format!("/{}", mutated.join("/")), parts.query),
            context: format!("{}{}", index, segment),
        });
    }
    out
}

/// One `key=value` piece of a query, raw and decoded.
struct QueryPair<'a> {
    raw_key: &'a str,
    raw_value: Option<&'a str>,
    key: String,
    value: String,
}

impl<'a> QueryPair<'a> {
    fn parse(piece: &'a str) -> Self {
        let (raw_key, raw_value) = match piece.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (piece, None),
        };
        let (key, value) = form_urlencoded::parse(piece.as_bytes())
            .next()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .unwrap_or_default();
        Self {
            raw_key,
            raw_value,
            key,
            value,
        }
    }

    fn render(&self) -> String {
        render_pair(self.raw_key, self.raw_value)
    }

    /// Raw array elements, keeping their original encoding when the commas
    /// are literal.
    fn raw_elements(&self) -> Vec<String> {
        match self.raw_value {
            Some(raw) if raw.contains(',') => raw.split(',').map(str::to_string).collect(),
            _ => self.value.split(',').map(encode).collect(),
        }
    }
}

fn render_pair(key: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("{}={}", key, value),
        None => key.to_string(),
    }
}

/// Query parameter mutations.
///
/// REMOVE deletes one `key=value` occurrence per test. Otherwise each
/// occurrence gets a key test and a value test, except comma separated
/// values, which are treated as arrays: one key test for the whole array and
/// one test per element. Pairs a test does not target keep their original
/// encoding.
pub fn query_mutations(base: &Url, value: &TestValue) -> Vec<UrlMutation> {
    let parts = UrlParts::of(base);
    let pairs: Vec<QueryPair> = parts
        .query
        .unwrap_or("")
        .split('&')
        .filter(|piece| !piece.is_empty())
        .map(QueryPair::parse)
        .collect();
    if pairs.is_empty() {
        return Vec::new();
    }
    let rendered: Vec<String> = pairs.iter().map(QueryPair::render).collect();
    let with_query = |index: usize, replacement: Option<String>| {
        let mut query = rendered.clone();
        match replacement {
            Some(pair) => query[index] = pair,
            None => {
                query.remove(index);
            }
        }
        let query = query.join("&");
        parts.assemble(parts.path, (!query.is_empty()).then_some(query.as_str()))
    };

    let mut keys: Vec<&str> = Vec::new();
    for pair in &pairs {
        if !keys.contains(&pair.key.as_str()) {
            keys.push(&pair.key);
        }
    }

    let encoded_value = encode(&value.value);
    let mut out = Vec::new();
    for key in keys {
        for (index, pair) in pairs.iter().enumerate().filter(|(_, p)| p.key == key) {
            let parameter = json!({ key: pair.value }).to_string();

            if value.test_type.is_remove() {
                out.push(UrlMutation {
                    url: with_query(index, None),
                    context: parameter,
                });
                continue;
            }

            let renamed = render_pair(&encoded_value, pair.raw_value);
            if pair.value.contains(',') {
                out.push(UrlMutation {
                    url: with_query(index, Some(renamed)),
                    context: format!("{}{}", key, parameter),
                });
                let elements: Vec<&str> = pair.value.split(',').collect();
                let raw_elements = pair.raw_elements();
                for (element_index, element) in elements.iter().enumerate() {
                    let mut replaced = raw_elements.clone();
                    replaced[element_index] = encoded_value.clone();
                    out.push(UrlMutation {
                        url: with_query(
                            index,
                            Some(render_pair(pair.raw_key, Some(&replaced.join(",")))),
                        ),
                        context: format!("{}{}{}", key, element_index, element),
                    });
                }
            } else {
                out.push(UrlMutation {
                    url: with_query(index, Some(renamed)),
                    context: format!("key{}", parameter),
                });
                out.push(UrlMutation {
                    url: with_query(index, Some(render_pair(pair.raw_key, Some(&encoded_value)))),
                    context: format!("value{}", parameter),
                });
            }
        }
    }
    out
}
