use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde_json::{Map, Value};

/// Marks a node in the FieldsV1 format as owned itself, in addition to its children.
const SELF_MARKER: &str = ".";
const FIELD_PREFIX: &str = "f:";

/// The path of a single field, for example `.spec.replicas`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parses a dotted path like `metadata.labels`. A leading dot is optional.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|segment| !segment.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_owned());
        Self(segments)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

impl<const N: usize> From<[&str; N]> for FieldPath {
    fn from(segments: [&str; N]) -> Self {
        Self(segments.iter().map(|s| (*s).to_owned()).collect())
    }
}

/// A set of owned fields. Lists, scalars and empty objects are leaves, lists
/// are never split into their elements.
pub type FieldSet = BTreeSet<FieldPath>;

/// Collects every leaf of `value` together with its value, skipping all fields
/// below one of the `ignored` paths.
pub(crate) fn leaves(value: &Value, ignored: &[FieldPath]) -> BTreeMap<FieldPath, Value> {
    let mut leaves = BTreeMap::new();
    collect_leaves(value, FieldPath::default(), ignored, &mut leaves);
    leaves
}

fn collect_leaves(
    value: &Value,
    path: FieldPath,
    ignored: &[FieldPath],
    leaves: &mut BTreeMap<FieldPath, Value>,
) {
    if ignored.iter().any(|ignored| path.starts_with(ignored)) {
        return;
    }

    match value {
        Value::Object(object) if !object.is_empty() => {
            for (key, child) in object {
                collect_leaves(child, path.child(key), ignored, leaves);
            }
        }
        // The root itself is never a field
        _ if path.0.is_empty() => {}
        _ => {
            leaves.insert(path, value.clone());
        }
    }
}

pub(crate) fn value_at<'a>(root: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.0
        .iter()
        .try_fold(root, |value, segment| value.as_object()?.get(segment))
}

/// Removes the field at `path`, as well as every parent object left empty by
/// the removal.
pub(crate) fn remove_at(root: &mut Value, path: &FieldPath) {
    fn remove(value: &mut Value, segments: &[String]) -> bool {
        let Some((first, rest)) = segments.split_first() else {
            return false;
        };
        let Some(object) = value.as_object_mut() else {
            return false;
        };

        if rest.is_empty() {
            object.remove(first);
        } else if let Some(child) = object.get_mut(first) {
            if remove(child, rest) {
                object.remove(first);
            }
        }

        object.is_empty()
    }

    remove(root, &path.0);
}

/// Encodes a [`FieldSet`] in the Kubernetes FieldsV1 format, for example
/// `{"f:spec":{"f:replicas":{}}}`.
pub fn encode_fields_v1(fields: &FieldSet) -> Value {
    let mut root = Map::new();

    for path in fields {
        let mut node = &mut root;
        for segment in path.segments() {
            let child = node
                .entry(format!("{FIELD_PREFIX}{segment}"))
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(child) = child else {
                break;
            };
            node = child;
        }
    }

    // Parents which are owned themselves in addition to their children
    for path in fields {
        if let Some(node) = node_mut(&mut root, path.segments())
            && !node.is_empty()
        {
            node.insert(SELF_MARKER.to_owned(), Value::Object(Map::new()));
        }
    }

    Value::Object(root)
}

fn node_mut<'a>(
    root: &'a mut Map<String, Value>,
    segments: &[String],
) -> Option<&'a mut Map<String, Value>> {
    segments.iter().try_fold(root, |node, segment| {
        node.get_mut(&format!("{FIELD_PREFIX}{segment}"))?
            .as_object_mut()
    })
}

/// Decodes the FieldsV1 format. Returns [`None`] if `value` is not a valid
/// FieldsV1 document.
pub fn decode_fields_v1(value: &Value) -> Option<FieldSet> {
    let mut fields = FieldSet::new();
    decode_node(value.as_object()?, FieldPath::default(), &mut fields)?;
    Some(fields)
}

fn decode_node(node: &Map<String, Value>, path: FieldPath, fields: &mut FieldSet) -> Option<()> {
    if node.is_empty() && !path.0.is_empty() {
        fields.insert(path);
        return Some(());
    }

    for (key, child) in node {
        if key == SELF_MARKER {
            fields.insert(path.clone());
            continue;
        }
        // Only plain fields are ever produced by this crate, list element
        // keys (k:, v:, i:) are skipped.
        let Some(segment) = key.strip_prefix(FIELD_PREFIX) else {
            continue;
        };
        decode_node(child.as_object()?, path.child(segment), fields)?;
    }

    Some(())
}
