use std::collections::BTreeMap;

/// The patch strategy of a single field, as declared by the
/// `x-kubernetes-patch-strategy` extension of the OpenAPI schema.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum PatchStrategy {
    /// The patch value replaces the original value. This is the default for
    /// every field not listed in a [`SchemaReference`].
    #[default]
    #[strum(serialize = "replace")]
    Replace,

    #[strum(serialize = "merge")]
    Merge,

    #[strum(serialize = "retainKeys")]
    RetainKeys,

    #[strum(to_string = "merge,retainKeys", serialize = "retainKeys,merge")]
    MergeRetainKeys,
}

impl PatchStrategy {
    pub fn is_merge(&self) -> bool {
        matches!(self, Self::Merge | Self::MergeRetainKeys)
    }
}

/// Merge information about a single field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldSchema {
    pub strategy: PatchStrategy,

    /// The key identifying list elements, `x-kubernetes-patch-merge-key`.
    /// Lists with a merge strategy but without a merge key are treated as
    /// sets of primitive values.
    pub merge_key: Option<String>,
}

/// Describes how the fields of one kind of object are merged.
///
/// Fields are addressed by their dotted path from the object root, for
/// example `spec.template.spec.containers`. List elements do not add a path
/// segment, so the ports of a container are addressed as
/// `spec.template.spec.containers.ports`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaReference {
    fields: BTreeMap<String, FieldSchema>,
}

impl SchemaReference {
    pub fn builder() -> SchemaReferenceBuilder {
        SchemaReferenceBuilder::default()
    }

    /// Returns the merge information of the field at `path`, if the field
    /// deviates from the default (replace) strategy.
    pub fn field(&self, path: &str) -> Option<&FieldSchema> {
        self.fields.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Builds a [`SchemaReference`].
///
/// ```
/// use stackable_strategic_merge::{PatchStrategy, SchemaReference};
///
/// let schema = SchemaReference::builder()
///     .with_object_meta()
///     .merge_list("spec.template.spec.containers", "name")
///     .merge_list("spec.template.spec.containers.ports", "containerPort")
///     .build();
///
/// let containers = schema.field("spec.template.spec.containers").unwrap();
/// assert_eq!(containers.strategy, PatchStrategy::Merge);
/// assert_eq!(containers.merge_key.as_deref(), Some("name"));
/// ```
#[derive(Debug, Default)]
pub struct SchemaReferenceBuilder {
    fields: BTreeMap<String, FieldSchema>,
}

impl SchemaReferenceBuilder {
    /// Declares the list at `path` to be merged by `merge_key`.
    pub fn merge_list(self, path: impl Into<String>, merge_key: impl Into<String>) -> Self {
        self.field(path, FieldSchema {
            strategy: PatchStrategy::Merge,
            merge_key: Some(merge_key.into()),
        })
    }

    /// Declares the list at `path` to be a set of primitive values.
    pub fn merge_set(self, path: impl Into<String>) -> Self {
        self.field(path, FieldSchema {
            strategy: PatchStrategy::Merge,
            merge_key: None,
        })
    }

    /// Declares the object at `path` to support the `$retainKeys` directive.
    pub fn retain_keys(self, path: impl Into<String>) -> Self {
        self.field(path, FieldSchema {
            strategy: PatchStrategy::RetainKeys,
            merge_key: None,
        })
    }

    pub fn field(mut self, path: impl Into<String>, schema: FieldSchema) -> Self {
        self.fields.insert(path.into(), schema);
        self
    }

    /// Adds the strategies of the standard object metadata, which every
    /// Kubernetes object shares.
    pub fn with_object_meta(self) -> Self {
        self.merge_set("metadata.finalizers")
            .merge_list("metadata.ownerReferences", "uid")
    }

    pub fn build(self) -> SchemaReference {
        SchemaReference {
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("replace", PatchStrategy::Replace)]
    #[case("merge", PatchStrategy::Merge)]
    #[case("retainKeys", PatchStrategy::RetainKeys)]
    #[case("merge,retainKeys", PatchStrategy::MergeRetainKeys)]
    #[case("retainKeys,merge", PatchStrategy::MergeRetainKeys)]
    fn parse_patch_strategy(#[case] input: &str, #[case] expected: PatchStrategy) {
        let strategy = PatchStrategy::from_str(input).expect("valid patch strategy");
        assert_eq!(strategy, expected);
    }

    #[test]
    fn unknown_fields_use_default_strategy() {
        let schema = SchemaReference::builder().with_object_meta().build();

        assert!(schema.field("spec.replicas").is_none());
        assert!(
            schema
                .field("metadata.finalizers")
                .expect("finalizers are declared")
                .strategy
                .is_merge()
        );
    }
}
