use serde::Serialize;
use simlab_core::Artifact;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataField {
    Name,
    Type,
    Documentation,
    Command,
    Path,
    WorkingDirectory,
    Git,
    Inputs,
}

impl MetadataField {
    pub fn as_str(self) -> &'static str {
        match self {
            MetadataField::Name => "name",
            MetadataField::Type => "type",
            MetadataField::Documentation => "documentation",
            MetadataField::Command => "command",
            MetadataField::Path => "path",
            MetadataField::WorkingDirectory => "working_directory",
            MetadataField::Git => "git",
            MetadataField::Inputs => "inputs",
        }
    }
}

/// A provenance field that differs between two artifacts sharing an id and
/// content hash. Informational: it never changes equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataMismatch {
    pub artifact_id: Uuid,
    pub field: MetadataField,
    pub current: String,
    pub stored: String,
}

impl fmt::Display for MetadataMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mismatch for {}: {:?} != {:?}",
            self.field.as_str(),
            self.artifact_id,
            self.current,
            self.stored
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub equal: bool,
    pub mismatches: Vec<MetadataMismatch>,
}

pub fn equal(a: &Artifact, b: &Artifact) -> bool {
    a.id == b.id && a.content_hash == b.content_hash
}

/// Mismatches are only collected when the two artifacts are equal; unequal
/// artifacts are different products and their metadata is not comparable.
pub fn compare(current: &Artifact, stored: &Artifact) -> Comparison {
    if !equal(current, stored) {
        return Comparison {
            equal: false,
            mismatches: vec![],
        };
    }
    let mut mismatches = Vec::new();
    let mut check = |field: MetadataField, a: String, b: String| {
        if a != b {
            mismatches.push(MetadataMismatch {
                artifact_id: current.id,
                field,
                current: a,
                stored: b,
            });
        }
    };
    check(MetadataField::Name, current.name.clone(), stored.name.clone());
    check(MetadataField::Type, current.kind.clone(), stored.kind.clone());
    check(
        MetadataField::Documentation,
        current.documentation.clone(),
        stored.documentation.clone(),
    );
    check(
        MetadataField::Command,
        current.command.clone(),
        stored.command.clone(),
    );
    check(
        MetadataField::Path,
        current.path.display().to_string(),
        stored.path.display().to_string(),
    );
    check(
        MetadataField::WorkingDirectory,
        current.working_directory.display().to_string(),
        stored.working_directory.display().to_string(),
    );
    check(
        MetadataField::Git,
        format!("{:?}", current.git),
        format!("{:?}", stored.git),
    );
    check(
        MetadataField::Inputs,
        join_ids(&current.inputs),
        join_ids(&stored.inputs),
    );
    Comparison {
        equal: true,
        mismatches,
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
