use serde::Serialize;
use serde_json::{json, Map, Number, Value};
use tracing::warn;

use super::Mutation;
use crate::values::{TestType, TestValue};

/// Step from a container to one of its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PathKey {
    Key(String),
    Index(usize),
}

/// One entry of the body tree: where it sits, its key and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyNode {
    pub path: Vec<PathKey>,
    pub key: PathKey,
    pub value: Value,
}

impl BodyNode {
    fn context(&self) -> String {
        json!({"path": self.path, "key": self.key, "value": self.value}).to_string()
    }
}

/// Every map entry and list element at every depth, containers included.
pub fn enumerate(body: &Value) -> Vec<BodyNode> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    visit(body, &mut path, &mut out);
    out
}

fn visit(node: &Value, path: &mut Vec<PathKey>, out: &mut Vec<BodyNode>) {
    let children: Vec<(PathKey, &Value)> = match node {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (PathKey::Key(k.clone()), v))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (PathKey::Index(i), v))
            .collect(),
        _ => return,
    };
    for (key, child) in children {
        out.push(BodyNode {
            path: path.clone(),
            key: key.clone(),
            value: child.clone(),
        });
        path.push(key);
        visit(child, path, out);
        path.pop();
    }
}

#[derive(Debug, Clone)]
enum Edit {
    Remove,
    ReplaceValue(Value),
    RenameKey(String),
}

/// New tree equal to `root` except for the edit applied at `path`/`key`.
fn rewrite(node: &Value, path: &[PathKey], key: &PathKey, edit: &Edit) -> Value {
    match path.split_first() {
        None => apply(node, key, edit),
        Some((head, rest)) => match (node, head) {
            (Value::Object(map), PathKey::Key(step)) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let v = if k == step {
                            rewrite(v, rest, key, edit)
                        } else {
                            v.clone()
                        };
                        (k.clone(), v)
                    })
                    .collect(),
            ),
            (Value::Array(items), PathKey::Index(step)) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        if i == *step {
                            rewrite(v, rest, key, edit)
                        } else {
                            v.clone()
                        }
                    })
                    .collect(),
            ),
            _ => node.clone(),
        },
    }
}

fn apply(container: &Value, key: &PathKey, edit: &Edit) -> Value {
    match (container, key) {
        (Value::Object(map), PathKey::Key(target)) => {
            let mut out = Map::new();
            for (k, v) in map {
                if k != target {
                    out.insert(k.clone(), v.clone());
                    continue;
                }
                match edit {
                    Edit::Remove => {}
                    Edit::ReplaceValue(new) => {
                        out.insert(k.clone(), new.clone());
                    }
                    Edit::RenameKey(new) => {
                        out.insert(new.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        }
        (Value::Array(items), PathKey::Index(target)) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, v) in items.iter().enumerate() {
                if i != *target {
                    out.push(v.clone());
                    continue;
                }
                match edit {
                    Edit::Remove => {}
                    Edit::ReplaceValue(new) => out.push(new.clone()),
                    Edit::RenameKey(_) => out.push(v.clone()),
                }
            }
            Value::Array(out)
        }
        _ => container.clone(),
    }
}

/// Whether the map at `path` already holds `key`. Renaming onto an existing
/// sibling would change two fields at once.
fn has_key(root: &Value, path: &[PathKey], key: &str) -> bool {
    let mut node = root;
    for step in path {
        let next = match (node, step) {
            (Value::Object(map), PathKey::Key(k)) => map.get(k),
            (Value::Array(items), PathKey::Index(i)) => items.get(*i),
            _ => None,
        };
        match next {
            Some(next) => node = next,
            None => return false,
        }
    }
    matches!(node, Value::Object(map) if map.contains_key(key))
}

/// Converts a raw test value into the JSON type its test type names.
pub fn coerce(test_type: TestType, raw: &str) -> Option<Value> {
    match test_type {
        TestType::Integer => raw.trim().parse::<i64>().ok().map(Value::from),
        TestType::Double => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        TestType::String | TestType::Remove => Some(Value::String(raw.to_string())),
    }
}

/// Body mutations for one test value over the pre-enumerated `nodes` of
/// `base`. The url stays at its baseline.
pub(crate) fn body_mutations(
    url: &str,
    base: &Value,
    nodes: &[BodyNode],
    value: &TestValue,
) -> Vec<Mutation> {
    let mutation = |node: &BodyNode, edit: &Edit, context: String| Mutation {
        url: url.to_string(),
        body: Some(rewrite(base, &node.path, &node.key, edit)),
        context,
    };

    if value.test_type.is_remove() {
        return nodes
            .iter()
            .map(|node| mutation(node, &Edit::Remove, node.context()))
            .collect();
    }

    let replacement = match coerce(value.test_type, &value.value) {
        Some(replacement) => replacement,
        None => {
            warn!(
                "Skipping body tests: {:?} is not a valid {} value",
                value.value, value.test_type
            );
            return Vec::new();
        }
    };

    let replace = Edit::ReplaceValue(replacement);
    let rename = Edit::RenameKey(value.value.clone());
    let mut out = Vec::with_capacity(nodes.len() * 2);
    for node in nodes {
        // JSON keys are strings, and list positions have no key to rename.
        if value.test_type == TestType::String
            && matches!(node.key, PathKey::Key(_))
            && !has_key(base, &node.path, &value.value)
        {
            out.push(mutation(node, &rename, format!("key{}", node.context())));
        }
        out.push(mutation(node, &replace, node.context()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(test_type: TestType, raw: &str) -> TestValue {
        TestValue {
            test_type,
            value: raw.to_string(),
        }
    }

    #[test]
    fn test_enumerate_visits_containers_and_elements() {
        let body = json!({"ids": [1, 2], "name": "n"});
        let nodes = enumerate(&body);
        let keys: Vec<(Vec<PathKey>, PathKey)> =
            nodes.iter().map(|n| (n.path.clone(), n.key.clone())).collect();
        assert_eq!(
            keys,
            vec![
                (vec![], PathKey::Key("ids".to_string())),
                (vec![PathKey::Key("ids".to_string())], PathKey::Index(0)),
                (vec![PathKey::Key("ids".to_string())], PathKey::Index(1)),
                (vec![], PathKey::Key("name".to_string())),
            ]
        );
    }

    #[test]
    fn test_scalar_body_has_no_nodes() {
        assert!(enumerate(&json!("plain")).is_empty());
    }

    #[test]
    fn test_rewrite_nested_value_leaves_rest_untouched() {
        let body = json!({"a": {"b": [1, {"c": true}]}, "d": 1});
        let path = vec![
            PathKey::Key("a".to_string()),
            PathKey::Key("b".to_string()),
            PathKey::Index(1),
        ];
        let out = rewrite(
            &body,
            &path,
            &PathKey::Key("c".to_string()),
            &Edit::ReplaceValue(json!(0)),
        );
        assert_eq!(out, json!({"a": {"b": [1, {"c": 0}]}, "d": 1}));
        // The source tree is never modified.
        assert_eq!(body["a"]["b"][1]["c"], json!(true));
    }

    #[test]
    fn test_remove_list_element() {
        let body = json!({"ids": [1, 2, 3]});
        let out = rewrite(
            &body,
            &[PathKey::Key("ids".to_string())],
            &PathKey::Index(1),
            &Edit::Remove,
        );
        assert_eq!(out, json!({"ids": [1, 3]}));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(TestType::Integer, " 12 "), Some(json!(12)));
        assert_eq!(coerce(TestType::Integer, "1.5"), None);
        assert_eq!(coerce(TestType::Double, "1.5"), Some(json!(1.5)));
        assert_eq!(coerce(TestType::Double, "NaN"), None);
        assert_eq!(coerce(TestType::String, "x"), Some(json!("x")));
    }

    #[test]
    fn test_string_mutations_rename_keys_but_not_indexes() {
        let body = json!({"ids": [1]});
        let nodes = enumerate(&body);
        let out = body_mutations("http://h/", &body, &nodes, &value(TestType::String, "S"));
        let bodies: Vec<Value> = out.iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(
            bodies,
            vec![json!({"S": [1]}), json!({"ids": "S"}), json!({"ids": ["S"]})]
        );
    }

    #[test]
    fn test_integer_mutations_skip_key_rename() {
        let body = json!({"n": 1, "s": "a"});
        let nodes = enumerate(&body);
        let out = body_mutations("http://h/", &body, &nodes, &value(TestType::Integer, "7"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].body, Some(json!({"n": 7, "s": "a"})));
    }

    #[test]
    fn test_uncoercible_value_skips_body() {
        let body = json!({"n": 1});
        let nodes = enumerate(&body);
        let out = body_mutations("http://h/", &body, &nodes, &value(TestType::Integer, "abc"));
        assert!(out.is_empty());
    }

    #[test]
    fn test_remove_mutations_drop_one_node_each() {
        let body = json!({"a": 1, "b": {"c": 2}});
        let nodes = enumerate(&body);
        let out = body_mutations("http://h/", &body, &nodes, &value(TestType::Remove, ""));
        let bodies: Vec<Value> = out.iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(
            bodies,
            vec![json!({"b": {"c": 2}}), json!({"a": 1}), json!({"a": 1, "b": {}})]
        );
    }

    #[test]
    fn test_rename_onto_existing_sibling_is_skipped() {
        let body = json!({"name": "n", "nested": {"id": 1, "name": "x"}});
        let nodes = enumerate(&body);
        let out = body_mutations("http://h/", &body, &nodes, &value(TestType::String, "id"));

        let renamed: Vec<Value> = out
            .iter()
            .filter(|m| m.context.starts_with("key"))
            .map(|m| m.body.clone().unwrap())
            .collect();
        // Inside `nested` the key `id` is taken, so only the top level
        // entries get a key test.
        assert_eq!(
            renamed,
            vec![
                json!({"id": "n", "nested": {"id": 1, "name": "x"}}),
                json!({"name": "n", "id": {"id": 1, "name": "x"}}),
            ]
        );
    }
}
