use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry};
use snafu::{OptionExt, ensure};

use crate::{
    DecodeManagedFieldsSnafu, Result,
    field_set::{FieldPath, FieldSet, decode_fields_v1, encode_fields_v1},
};

const FIELDS_TYPE_V1: &str = "FieldsV1";

/// The operation which caused a manager to own its fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Operation {
    Apply,
    Update,
}

/// The fields owned by one manager for one [`Operation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedEntry {
    pub manager: String,
    pub operation: Operation,
    pub api_version: Option<String>,
    pub fields: FieldSet,
}

/// The decoded form of `metadata.managedFields`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedFields {
    entries: Vec<ManagedEntry>,
}

impl ManagedFields {
    pub fn decode(entries: Option<&[ManagedFieldsEntry]>) -> Result<Self> {
        let entries = entries
            .unwrap_or_default()
            .iter()
            .map(|entry| {
                let manager = entry.manager.clone().unwrap_or_default();

                let operation = entry
                    .operation
                    .as_deref()
                    .and_then(|operation| Operation::from_str(operation).ok())
                    .with_context(|| DecodeManagedFieldsSnafu {
                        manager: manager.clone(),
                        reason: format!("unsupported operation {:?}", entry.operation),
                    })?;

                ensure!(
                    entry.fields_type.as_deref().is_none_or(|t| t == FIELDS_TYPE_V1),
                    DecodeManagedFieldsSnafu {
                        manager: manager.clone(),
                        reason: format!("unsupported fields type {:?}", entry.fields_type),
                    }
                );

                let fields = match &entry.fields_v1 {
                    Some(FieldsV1(fields)) => {
                        decode_fields_v1(fields).with_context(|| DecodeManagedFieldsSnafu {
                            manager: manager.clone(),
                            reason: "invalid FieldsV1 document",
                        })?
                    }
                    None => FieldSet::new(),
                };

                Ok(ManagedEntry {
                    manager,
                    operation,
                    api_version: entry.api_version.clone(),
                    fields,
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self { entries })
    }

    /// Encodes the entries, dropping every entry which does not own any field.
    /// Returns [`None`] if no entry is left.
    pub fn encode(&self) -> Option<Vec<ManagedFieldsEntry>> {
        let entries: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| !entry.fields.is_empty())
            .map(|entry| ManagedFieldsEntry {
                api_version: entry.api_version.clone(),
                fields_type: Some(FIELDS_TYPE_V1.to_owned()),
                fields_v1: Some(FieldsV1(encode_fields_v1(&entry.fields))),
                manager: Some(entry.manager.clone()),
                operation: Some(entry.operation.to_string()),
                ..Default::default()
            })
            .collect();

        (!entries.is_empty()).then_some(entries)
    }

    pub fn entries(&self) -> &[ManagedEntry] {
        &self.entries
    }

    pub fn get(&self, manager: &str, operation: Operation) -> Option<&ManagedEntry> {
        self.entries
            .iter()
            .find(|entry| entry.manager == manager && entry.operation == operation)
    }

    /// Returns the entry of `manager` for `operation`, creating an empty one if
    /// it doesn't exist yet.
    pub fn entry_mut(
        &mut self,
        manager: &str,
        operation: Operation,
        api_version: Option<&str>,
    ) -> &mut ManagedEntry {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.manager == manager && entry.operation == operation);

        let index = match position {
            Some(index) => index,
            None => {
                self.entries.push(ManagedEntry {
                    manager: manager.to_owned(),
                    operation,
                    api_version: None,
                    fields: FieldSet::new(),
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        if let Some(api_version) = api_version {
            entry.api_version = Some(api_version.to_owned());
        }
        entry
    }

    /// Removes `fields` from every entry.
    pub fn release(&mut self, fields: &FieldSet) {
        for entry in &mut self.entries {
            entry.fields.retain(|field| !fields.contains(field));
        }
    }

    /// Returns `true` if any manager other than `manager` owns `field`.
    pub fn owned_by_others(&self, field: &FieldPath, manager: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.manager != manager && entry.fields.contains(field))
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut ManagedEntry> {
        self.entries.iter_mut()
    }
}
