use serde_json::{Map, Value};

/// Folds one more shard response into the accumulated one.
///
/// Arrays concatenate and objects merge key by key, recursing on shared
/// keys. `null` stands for "no answer" and yields to the other side. Equal
/// values collapse into one; any other mismatch keeps both as `[left, right]`.
pub fn merge_responses(left: Value, right: Value) -> Value {
    match (left, right) {
        (Value::Null, right) => right,
        (left, Value::Null) => left,
        (Value::Array(mut left), Value::Array(right)) => {
            left.extend(right);
            Value::Array(left)
        }
        (Value::Object(left), Value::Object(right)) => Value::Object(merge_objects(left, right)),
        (left, right) if loosely_equal(&left, &right) => left,
        (left, right) => Value::Array(vec![left, right]),
    }
}

fn merge_objects(mut left: Map<String, Value>, right: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in right {
        let merged = match left.remove(&key) {
            Some(existing) => merge_responses(existing, value),
            None => value,
        };
        left.insert(key, merged);
    }
    left
}

/// Structural equality that also accepts a number or boolean against its
/// string form, as shards do not agree on how they encode scalars.
pub fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(number), Value::String(text))
        | (Value::String(text), Value::Number(number)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .zip(number.as_f64())
            .is_some_and(|(parsed, number)| parsed == number),
        (Value::Bool(flag), Value::String(text)) | (Value::String(text), Value::Bool(flag)) => {
            text == if *flag { "true" } else { "false" }
        }
        (Value::Number(left), Value::Number(right)) => left.as_f64() == right.as_f64(),
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right)
                    .all(|(left, right)| loosely_equal(left, right))
        }
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left.iter().all(|(key, value)| {
                    right
                        .get(key)
                        .is_some_and(|other| loosely_equal(value, other))
                })
        }
        (left, right) => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arrays_concatenate() {
        assert_eq!(merge_responses(json!([1, 2]), json!([3])), json!([1, 2, 3]));
    }

    #[test]
    fn test_disjoint_objects_union() {
        assert_eq!(
            merge_responses(json!({"a": 1}), json!({"b": 2})),
            json!({"a": 1, "b": 2})
        );
    }

    #[test]
    fn test_colliding_scalars_become_pair() {
        assert_eq!(
            merge_responses(json!({"a": 1}), json!({"a": 2})),
            json!({"a": [1, 2]})
        );
    }

    #[test]
    fn test_nested_objects_merge_recursively() {
        assert_eq!(
            merge_responses(
                json!({"stats": {"posts": [1], "shard": "a"}}),
                json!({"stats": {"posts": [2], "region": "eu"}})
            ),
            json!({"stats": {"posts": [1, 2], "shard": "a", "region": "eu"}})
        );
    }

    #[test]
    fn test_equal_values_and_nulls_collapse() {
        assert_eq!(merge_responses(json!("ok"), json!("ok")), json!("ok"));
        assert_eq!(merge_responses(Value::Null, json!([1])), json!([1]));
        assert_eq!(merge_responses(json!({"a": 1}), Value::Null), json!({"a": 1}));
    }

    #[test]
    fn test_loose_equality_across_scalar_types() {
        assert!(loosely_equal(&json!(42), &json!("42")));
        assert!(loosely_equal(&json!(1.5), &json!(1.5)));
        assert!(loosely_equal(&json!(true), &json!("true")));
        assert!(!loosely_equal(&json!(1), &json!("one")));
        assert!(loosely_equal(&json!({"lat": "10"}), &json!({"lat": 10})));
    }
}
