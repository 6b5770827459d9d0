use serde_json::Value;
use snafu::{OptionExt, ensure};

use crate::{
    BadDocSnafu, BadPrimitiveListFormatSnafu, BadRetainKeysFormatSnafu,
    BadSetElementOrderFormatSnafu, FieldSchema, Map, MissingMergeKeySnafu, NoListOfListsSnafu,
    Result, RetainKeysMismatchSnafu, SchemaReference, UnsupportedFormatSnafu,
};

const PATCH_DIRECTIVE: &str = "$patch";
const RETAIN_KEYS_DIRECTIVE: &str = "$retainKeys";
const DELETE_FROM_PRIMITIVE_LIST_PREFIX: &str = "$deleteFromPrimitiveList/";
const SET_ELEMENT_ORDER_PREFIX: &str = "$setElementOrder/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Directive {
    Replace,
    Delete,
    Merge,
}

fn parse_directive(value: &Value) -> Result<Directive> {
    let Value::String(directive) = value else {
        return BadDocSnafu {
            reason: format!("{PATCH_DIRECTIVE} directive must be a string"),
        }
        .fail();
    };

    match directive.as_str() {
        "replace" => Ok(Directive::Replace),
        "delete" => Ok(Directive::Delete),
        "merge" => Ok(Directive::Merge),
        other => UnsupportedFormatSnafu { directive: other }.fail(),
    }
}

/// Parses the raw bytes of a strategic merge patch. The patch must be a JSON
/// object.
pub fn parse_patch(patch: &[u8]) -> Result<Map> {
    match serde_json::from_slice(patch) {
        Ok(Value::Object(patch)) => Ok(patch),
        Ok(_) => BadDocSnafu {
            reason: "patch must be a JSON object",
        }
        .fail(),
        Err(err) => BadDocSnafu {
            reason: err.to_string(),
        }
        .fail(),
    }
}

/// Merges `patch` into `original`, using `schema` to decide how lists are
/// merged. Neither input is modified.
///
/// A top-level `$patch: delete` directive results in an empty object.
pub fn strategic_merge_map_patch(
    original: &Map,
    patch: &Map,
    schema: &SchemaReference,
) -> Result<Map> {
    let merged = merge_map(original.clone(), patch.clone(), schema, "")?;
    Ok(merged.unwrap_or_default())
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_owned()
    } else {
        format!("{path}.{key}")
    }
}

/// Returns [`None`] if the object is deleted by a `$patch: delete` directive.
fn merge_map(
    mut original: Map,
    mut patch: Map,
    schema: &SchemaReference,
    path: &str,
) -> Result<Option<Map>> {
    if let Some(directive) = patch.remove(PATCH_DIRECTIVE) {
        match parse_directive(&directive)? {
            Directive::Delete => return Ok(None),
            Directive::Replace => original.clear(),
            Directive::Merge => {}
        }
    }

    if let Some(retain_keys) = patch.remove(RETAIN_KEYS_DIRECTIVE) {
        let retain_keys = parse_retain_keys(retain_keys)?;
        if let Some(key) = patch
            .keys()
            .find(|key| !key.starts_with('$') && !retain_keys.contains(key))
        {
            return RetainKeysMismatchSnafu { key: key.clone() }.fail();
        }
        original.retain(|key, _| retain_keys.contains(key));
    }

    let deletions = take_prefixed(&mut patch, DELETE_FROM_PRIMITIVE_LIST_PREFIX);
    let orders = take_prefixed(&mut patch, SET_ELEMENT_ORDER_PREFIX);

    for (field, values) in deletions {
        let Value::Array(values) = values else {
            return BadPrimitiveListFormatSnafu { field }.fail();
        };
        match original.get_mut(&field) {
            Some(Value::Array(current)) => current.retain(|value| !values.contains(value)),
            Some(_) => return BadPrimitiveListFormatSnafu { field }.fail(),
            None => {}
        }
    }

    for (key, value) in patch {
        if value.is_null() {
            original.remove(&key);
            continue;
        }

        let field_path = join_path(path, &key);
        let merged = match (original.remove(&key), value) {
            (Some(Value::Object(current)), Value::Object(value)) => {
                merge_map(current, value, schema, &field_path)?.map(Value::Object)
            }
            (Some(Value::Array(current)), Value::Array(value)) => Some(Value::Array(merge_list(
                current,
                value,
                schema,
                &field_path,
            )?)),
            // Nothing to merge with, but directives still need to be resolved
            (_, Value::Object(value)) => {
                merge_map(Map::new(), value, schema, &field_path)?.map(Value::Object)
            }
            (_, Value::Array(value)) => Some(Value::Array(merge_list(
                Vec::new(),
                value,
                schema,
                &field_path,
            )?)),
            (_, value) => Some(value),
        };

        if let Some(merged) = merged {
            original.insert(key, merged);
        }
    }

    for (field, order) in orders {
        let Value::Array(order) = order else {
            return BadSetElementOrderFormatSnafu { field }.fail();
        };
        let field_path = join_path(path, &field);
        let merge_key = schema
            .field(&field_path)
            .and_then(|field| field.merge_key.as_deref());

        if let Some(Value::Array(current)) = original.get_mut(&field) {
            reorder(current, &order, merge_key, &field_path)?;
        }
    }

    Ok(Some(original))
}

fn take_prefixed(patch: &mut Map, prefix: &str) -> Vec<(String, Value)> {
    let keys: Vec<String> = patch
        .keys()
        .filter(|key| key.starts_with(prefix))
        .cloned()
        .collect();

    keys.into_iter()
        .filter_map(|key| {
            let value = patch.remove(&key)?;
            Some((key[prefix.len()..].to_owned(), value))
        })
        .collect()
}

fn parse_retain_keys(value: Value) -> Result<Vec<String>> {
    let Value::Array(keys) = value else {
        return BadRetainKeysFormatSnafu.fail();
    };

    keys.into_iter()
        .map(|key| match key {
            Value::String(key) => Ok(key),
            _ => BadRetainKeysFormatSnafu.fail(),
        })
        .collect()
}

fn merge_list(
    original: Vec<Value>,
    patch: Vec<Value>,
    schema: &SchemaReference,
    path: &str,
) -> Result<Vec<Value>> {
    ensure!(
        !patch.iter().any(Value::is_array),
        NoListOfListsSnafu { field: path }
    );

    // A single `$patch: replace` element turns the whole list into a replacement
    let mut replace = false;
    for element in &patch {
        if let Some(directive) = element.get(PATCH_DIRECTIVE) {
            replace |= parse_directive(directive)? == Directive::Replace;
        }
    }

    match schema.field(path) {
        Some(FieldSchema {
            strategy,
            merge_key: Some(merge_key),
        }) if strategy.is_merge() && !replace => {
            merge_keyed_list(original, patch, merge_key, schema, path)
        }
        Some(FieldSchema {
            strategy,
            merge_key: None,
        }) if strategy.is_merge() && !replace => merge_primitive_list(original, patch, path),
        _ => replace_list(patch, schema, path),
    }
}

fn replace_list(patch: Vec<Value>, schema: &SchemaReference, path: &str) -> Result<Vec<Value>> {
    let mut list = Vec::with_capacity(patch.len());

    for element in patch {
        match element {
            Value::Object(element) => {
                if element.len() == 1 && element.contains_key(PATCH_DIRECTIVE) {
                    continue;
                }
                if let Some(element) = merge_map(Map::new(), element, schema, path)? {
                    list.push(Value::Object(element));
                }
            }
            element => list.push(element),
        }
    }

    Ok(list)
}

fn merge_keyed_list(
    mut original: Vec<Value>,
    patch: Vec<Value>,
    merge_key: &str,
    schema: &SchemaReference,
    path: &str,
) -> Result<Vec<Value>> {
    for element in patch {
        let Value::Object(element) = element else {
            return BadDocSnafu {
                reason: format!(
                    "list {path:?} is merged by key {merge_key:?}, but contains a primitive value"
                ),
            }
            .fail();
        };

        let key_value = element
            .get(merge_key)
            .cloned()
            .context(MissingMergeKeySnafu {
                field: path,
                merge_key,
            })?;

        let position = original
            .iter()
            .position(|current| current.get(merge_key) == Some(&key_value));

        match position {
            Some(position) => {
                let current = match std::mem::take(&mut original[position]) {
                    Value::Object(current) => current,
                    _ => Map::new(),
                };
                match merge_map(current, element, schema, path)? {
                    Some(merged) => original[position] = Value::Object(merged),
                    None => {
                        original.remove(position);
                    }
                }
            }
            None => {
                tracing::trace!(field = path, key = %key_value, "appending new list element");
                if let Some(merged) = merge_map(Map::new(), element, schema, path)? {
                    original.push(Value::Object(merged));
                }
            }
        }
    }

    Ok(original)
}

fn merge_primitive_list(
    mut original: Vec<Value>,
    patch: Vec<Value>,
    path: &str,
) -> Result<Vec<Value>> {
    for element in patch {
        ensure!(
            !element.is_object(),
            BadPrimitiveListFormatSnafu { field: path }
        );
        if !original.contains(&element) {
            original.push(element);
        }
    }

    Ok(original)
}

fn reorder(
    list: &mut Vec<Value>,
    order: &[Value],
    merge_key: Option<&str>,
    path: &str,
) -> Result<()> {
    let identity = |value: &Value| match merge_key {
        Some(merge_key) => value.get(merge_key).cloned(),
        None => Some(value.clone()),
    };

    let mut remaining = std::mem::take(list);
    for wanted in order {
        let wanted = identity(wanted).context(BadSetElementOrderFormatSnafu { field: path })?;
        if let Some(position) = remaining
            .iter()
            .position(|value| identity(value).as_ref() == Some(&wanted))
        {
            list.push(remaining.remove(position));
        }
    }
    list.extend(remaining);

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::Error;

    fn yaml(input: &str) -> Map {
        serde_yaml::from_str(input).expect("test YAML is valid")
    }

    fn deployment_schema() -> SchemaReference {
        SchemaReference::builder()
            .with_object_meta()
            .merge_list("spec.template.spec.containers", "name")
            .merge_list("spec.template.spec.containers.ports", "containerPort")
            .retain_keys("spec.strategy")
            .build()
    }

    fn deployment() -> Map {
        yaml(indoc! {"
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: web
              finalizers:
              - a.stackable.tech
              - b.stackable.tech
            spec:
              replicas: 1
              strategy:
                type: RollingUpdate
                rollingUpdate:
                  maxSurge: 1
              template:
                spec:
                  containers:
                  - name: app
                    image: app:1
                    ports:
                    - containerPort: 8080
                  - name: sidecar
                    image: sidecar:1
        "})
    }

    #[test]
    fn empty_patch_is_a_no_op() {
        let original = deployment();
        let merged = strategic_merge_map_patch(&original, &Map::new(), &deployment_schema())
            .expect("empty patch applies");
        assert_eq!(merged, original);
    }

    #[test]
    fn keyed_list_is_merged_by_key() {
        let patch = yaml(indoc! {"
            spec:
              template:
                spec:
                  containers:
                  - name: sidecar
                    image: sidecar:2
                  - name: logger
                    image: logger:1
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        assert_eq!(
            merged["spec"]["template"]["spec"]["containers"],
            json!([
                {"name": "app", "image": "app:1", "ports": [{"containerPort": 8080}]},
                {"name": "sidecar", "image": "sidecar:2"},
                {"name": "logger", "image": "logger:1"},
            ])
        );
    }

    #[test]
    fn list_without_schema_is_replaced() {
        let patch = yaml(indoc! {"
            spec:
              template:
                spec:
                  containers:
                  - name: sidecar
                    image: sidecar:2
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &SchemaReference::default())
            .expect("patch applies");

        assert_eq!(
            merged["spec"]["template"]["spec"]["containers"],
            json!([{"name": "sidecar", "image": "sidecar:2"}])
        );
    }

    #[test]
    fn nested_keyed_lists_are_merged() {
        let patch = yaml(indoc! {"
            spec:
              template:
                spec:
                  containers:
                  - name: app
                    ports:
                    - containerPort: 8443
                      name: https
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        assert_eq!(
            merged["spec"]["template"]["spec"]["containers"][0]["ports"],
            json!([{"containerPort": 8080}, {"containerPort": 8443, "name": "https"}])
        );
    }

    #[test]
    fn null_deletes_key() {
        let patch = yaml("spec: {replicas: null}");
        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        assert!(merged["spec"].get("replicas").is_none());
        assert!(merged["spec"].get("template").is_some());
    }

    #[test]
    fn delete_directive_removes_list_element() {
        let patch = yaml(indoc! {"
            spec:
              template:
                spec:
                  containers:
                  - name: sidecar
                    $patch: delete
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        let containers = merged["spec"]["template"]["spec"]["containers"]
            .as_array()
            .expect("containers are a list");
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["name"], "app");
    }

    #[test]
    fn replace_directive_replaces_list() {
        let patch = yaml(indoc! {"
            spec:
              template:
                spec:
                  containers:
                  - $patch: replace
                  - name: only
                    image: only:1
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        assert_eq!(
            merged["spec"]["template"]["spec"]["containers"],
            json!([{"name": "only", "image": "only:1"}])
        );
    }

    #[test]
    fn replace_directive_replaces_object() {
        let patch = yaml(indoc! {"
            spec:
              strategy:
                $patch: replace
                type: Recreate
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        assert_eq!(merged["spec"]["strategy"], json!({"type": "Recreate"}));
    }

    #[test]
    fn primitive_set_is_unioned_and_deleted_from() {
        let patch = yaml(indoc! {"
            metadata:
              $deleteFromPrimitiveList/finalizers:
              - a.stackable.tech
              finalizers:
              - c.stackable.tech
              - b.stackable.tech
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        assert_eq!(
            merged["metadata"]["finalizers"],
            json!(["b.stackable.tech", "c.stackable.tech"])
        );
    }

    #[test]
    fn retain_keys_drops_unlisted_keys() {
        let patch = yaml(indoc! {"
            spec:
              strategy:
                $retainKeys:
                - type
                type: Recreate
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        assert_eq!(merged["spec"]["strategy"], json!({"type": "Recreate"}));
    }

    #[test]
    fn set_element_order_reorders_merged_list() {
        let patch = yaml(indoc! {"
            spec:
              template:
                spec:
                  $setElementOrder/containers:
                  - name: sidecar
                  - name: app
        "});

        let merged = strategic_merge_map_patch(&deployment(), &patch, &deployment_schema())
            .expect("patch applies");

        let names: Vec<_> = merged["spec"]["template"]["spec"]["containers"]
            .as_array()
            .expect("containers are a list")
            .iter()
            .map(|container| container["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("sidecar"), json!("app")]);
    }

    #[rstest]
    #[case(
        "metadata: {$patch: 42}",
        Error::BadDoc { reason: "$patch directive must be a string".to_owned() }
    )]
    #[case(
        "metadata: {$patch: explode}",
        Error::UnsupportedFormat { directive: "explode".to_owned() }
    )]
    #[case(
        "metadata: {$deleteFromPrimitiveList/finalizers: a.stackable.tech}",
        Error::BadPrimitiveListFormat { field: "finalizers".to_owned() }
    )]
    #[case(
        "spec: {strategy: {$retainKeys: type}}",
        Error::BadRetainKeysFormat
    )]
    #[case(
        "spec: {strategy: {$retainKeys: [type], rollingUpdate: {maxSurge: 2}}}",
        Error::RetainKeysMismatch { key: "rollingUpdate".to_owned() }
    )]
    #[case(
        "spec: {template: {spec: {$setElementOrder/containers: name}}}",
        Error::BadSetElementOrderFormat { field: "containers".to_owned() }
    )]
    #[case(
        "spec: {template: {spec: {containers: [[app]]}}}",
        Error::NoListOfLists { field: "spec.template.spec.containers".to_owned() }
    )]
    #[case(
        "spec: {template: {spec: {containers: [{image: \"app:2\"}]}}}",
        Error::MissingMergeKey {
            field: "spec.template.spec.containers".to_owned(),
            merge_key: "name".to_owned(),
        }
    )]
    fn invalid_patches(#[case] patch: &str, #[case] expected: Error) {
        let err = strategic_merge_map_patch(&deployment(), &yaml(patch), &deployment_schema())
            .expect_err("patch must be rejected");
        assert_eq!(err, expected);
    }

    #[rstest]
    #[case(Error::NoListOfLists { field: "a".to_owned() }, true)]
    #[case(Error::RetainKeysMismatch { key: "a".to_owned() }, true)]
    #[case(Error::BadRetainKeysFormat, false)]
    #[case(Error::UnsupportedFormat { directive: "a".to_owned() }, false)]
    fn unprocessable_errors(#[case] err: Error, #[case] expected: bool) {
        assert_eq!(err.is_unprocessable(), expected);
    }

    #[rstest]
    #[case(b"[1, 2]".as_slice())]
    #[case(b"{not json".as_slice())]
    fn parse_patch_rejects_non_objects(#[case] input: &[u8]) {
        let err = parse_patch(input).expect_err("patch must be rejected");
        assert!(matches!(err, Error::BadDoc { .. }));
    }
}
