//! Ops files: ordered `replace` and `remove` operations on a manifest.
//!
//! Paths are `/`-separated. A segment is a map key, an array index, `-` (append to an array) or
//! `key=value` (the array element whose `key` equals `value`). A `?` suffix makes the segment,
//! and every segment after it, optional: missing entries are created by `replace` and ignored by
//! `remove`.
use serde::Deserialize;
use serde_json::{map::Entry, Map, Value};

/// A single ops file operation.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub path: String,
    #[serde(default)]
    pub value: Option<Value>,
}

/// Kinds of operations.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Replace,
    Remove,
}

/// Errors applying an ops file.
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("path '{path}' not found")]
    NotFound { path: String },
    #[error("replace operation on '{path}' has no value")]
    MissingValue { path: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Key { name: String, optional: bool },
    Index(usize),
    Append,
    Matcher { key: String, value: String, optional: bool },
}

/// Parse an ops file document.
pub fn parse(text: &str) -> Result<Vec<Operation>, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

/// Apply operations in order.
pub fn apply(document: &mut Value, operations: &[Operation]) -> Result<(), OpsError> {
    for operation in operations {
        let tokens = parse_path(&operation.path)?;
        match operation.op_type {
            OperationType::Replace => {
                let value = operation
                    .value
                    .clone()
                    .ok_or_else(|| OpsError::MissingValue {
                        path: operation.path.clone(),
                    })?;
                replace(document, &tokens, value, &operation.path)?;
            }
            OperationType::Remove => remove(document, &tokens, &operation.path)?,
        }
    }
    Ok(())
}

fn parse_path(path: &str) -> Result<Vec<Token>, OpsError> {
    let invalid = |reason| OpsError::InvalidPath {
        path: path.to_owned(),
        reason,
    };
    let segments = path
        .strip_prefix('/')
        .ok_or_else(|| invalid("must start with '/'"))?;

    let mut optional = false;
    let mut tokens = Vec::new();
    for segment in segments.split('/') {
        let segment = match segment.strip_suffix('?') {
            Some(stripped) => {
                optional = true;
                stripped
            }
            None => segment,
        };
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        let token = if segment == "-" {
            Token::Append
        } else if let Ok(index) = segment.parse::<usize>() {
            Token::Index(index)
        } else if let Some((key, value)) = segment.split_once('=') {
            Token::Matcher {
                key: key.to_owned(),
                value: value.to_owned(),
                optional,
            }
        } else {
            Token::Key {
                name: segment.to_owned(),
                optional,
            }
        };
        tokens.push(token);
    }
    if tokens[..tokens.len() - 1].contains(&Token::Append) {
        return Err(invalid("'-' is only allowed as last segment"));
    }
    Ok(tokens)
}

// Walk every token but the last one, creating optional entries on the way.
fn parent<'a>(
    document: &'a mut Value,
    tokens: &[Token],
    create: bool,
    path: &str,
) -> Result<Option<&'a mut Value>, OpsError> {
    let not_found = || OpsError::NotFound {
        path: path.to_owned(),
    };
    let mut node = document;
    for (position, token) in tokens[..tokens.len() - 1].iter().enumerate() {
        let next = &tokens[position + 1];
        node = match token {
            Token::Key { name, optional } => {
                let map = node.as_object_mut().ok_or_else(not_found)?;
                match map.entry(name.clone()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) if *optional && create => entry.insert(container(next)),
                    Entry::Vacant(_) if *optional => return Ok(None),
                    Entry::Vacant(_) => return Err(not_found()),
                }
            }
            Token::Index(index) => node
                .as_array_mut()
                .and_then(|array| array.get_mut(*index))
                .ok_or_else(not_found)?,
            Token::Matcher {
                key,
                value,
                optional,
            } => {
                let array = node.as_array_mut().ok_or_else(not_found)?;
                match find(array, key, value) {
                    Some(index) => &mut array[index],
                    None if *optional && create => {
                        let mut item = Map::new();
                        item.insert(key.clone(), Value::String(value.clone()));
                        array.push(Value::Object(item));
                        let last = array.len() - 1;
                        &mut array[last]
                    }
                    None if *optional => return Ok(None),
                    None => return Err(not_found()),
                }
            }
            Token::Append => unreachable!("rejected by parse_path"),
        };
    }
    Ok(Some(node))
}

fn container(next: &Token) -> Value {
    match next {
        Token::Index(_) | Token::Append | Token::Matcher { .. } => Value::Array(Vec::new()),
        Token::Key { .. } => Value::Object(Map::new()),
    }
}

fn find(array: &[Value], key: &str, value: &str) -> Option<usize> {
    array
        .iter()
        .position(|item| item.get(key).and_then(Value::as_str) == Some(value))
}

fn replace(document: &mut Value, tokens: &[Token], value: Value, path: &str) -> Result<(), OpsError> {
    let not_found = || OpsError::NotFound {
        path: path.to_owned(),
    };
    let node = parent(document, tokens, true, path)?.ok_or_else(not_found)?;
    match &tokens[tokens.len() - 1] {
        Token::Key { name, optional } => {
            let map = node.as_object_mut().ok_or_else(not_found)?;
            if !*optional && !map.contains_key(name) {
                return Err(not_found());
            }
            map.insert(name.clone(), value);
        }
        Token::Index(index) => {
            let slot = node
                .as_array_mut()
                .and_then(|array| array.get_mut(*index))
                .ok_or_else(not_found)?;
            *slot = value;
        }
        Token::Append => node.as_array_mut().ok_or_else(not_found)?.push(value),
        Token::Matcher {
            key,
            value: expected,
            optional,
        } => {
            let array = node.as_array_mut().ok_or_else(not_found)?;
            match find(array, key, expected) {
                Some(index) => array[index] = value,
                None if *optional => array.push(value),
                None => return Err(not_found()),
            }
        }
    }
    Ok(())
}

fn remove(document: &mut Value, tokens: &[Token], path: &str) -> Result<(), OpsError> {
    let not_found = || OpsError::NotFound {
        path: path.to_owned(),
    };
    let Some(node) = parent(document, tokens, false, path)? else {
        return Ok(());
    };
    match &tokens[tokens.len() - 1] {
        Token::Key { name, optional } => {
            let map = node.as_object_mut().ok_or_else(not_found)?;
            if map.remove(name).is_none() && !*optional {
                return Err(not_found());
            }
        }
        Token::Index(index) => {
            let array = node.as_array_mut().ok_or_else(not_found)?;
            if *index >= array.len() {
                return Err(not_found());
            }
            array.remove(*index);
        }
        Token::Matcher {
            key,
            value,
            optional,
        } => {
            let array = node.as_array_mut().ok_or_else(not_found)?;
            match find(array, key, value) {
                Some(index) => {
                    array.remove(index);
                }
                None if *optional => {}
                None => return Err(not_found()),
            }
        }
        Token::Append => {
            return Err(OpsError::InvalidPath {
                path: path.to_owned(),
                reason: "cannot remove '-'",
            })
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use serde_json::json;

    fn manifest() -> Value {
        json!({
            "name": "nats",
            "instance_groups": [
                {"name": "nats", "instances": 1, "jobs": [{"name": "nats", "release": "nats"}]},
                {"name": "smoke", "instances": 1},
            ],
        })
    }

    #[test]
    fn replace_with_matchers_and_indexes() {
        let mut document = manifest();
        let ops = parse(
            r#"
- type: replace
  path: /instance_groups/name=nats/instances
  value: 3
- type: replace
  path: /instance_groups/0/jobs/name=nats/properties?/nats/port
  value: 4222
- type: replace
  path: /instance_groups/-
  value: {name: errands}
"#,
        )
        .unwrap();
        apply(&mut document, &ops).unwrap();
        assert_eq!(document["instance_groups"][0]["instances"], json!(3));
        assert_eq!(
            document["instance_groups"][0]["jobs"][0]["properties"],
            json!({"nats": {"port": 4222}})
        );
        assert_eq!(document["instance_groups"][2], json!({"name": "errands"}));
    }

    #[test]
    fn remove_entries() {
        let mut document = manifest();
        let ops = parse(
            r#"
- type: remove
  path: /instance_groups/name=smoke
- type: remove
  path: /instance_groups/name=missing?/jobs
"#,
        )
        .unwrap();
        apply(&mut document, &ops).unwrap();
        assert_eq!(document["instance_groups"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn missing_entries_without_optional_marker_fail() {
        let mut document = manifest();
        let ops = parse(
            r#"
- type: replace
  path: /instance_groups/name=nats/update/canaries
  value: 1
"#,
        )
        .unwrap();
        let err = apply(&mut document, &ops).unwrap_err();
        expect![[r#"path '/instance_groups/name=nats/update/canaries' not found"#]]
            .assert_eq(&err.to_string());
    }

    #[test]
    fn invalid_paths_are_rejected() {
        let mut document = manifest();
        let ops = vec![Operation {
            op_type: OperationType::Replace,
            path: "instance_groups".to_owned(),
            value: Some(json!([])),
        }];
        let err = apply(&mut document, &ops).unwrap_err();
        expect![[r#"invalid path 'instance_groups': must start with '/'"#]]
            .assert_eq(&err.to_string());
    }
}
