//! Persisted reconcile descriptors
//!
//! A queue entry's descriptor is an XML document recording exactly one of
//! four mutually exclusive actions plus its strategy parameters. The three
//! pre-consolidation root element names are rejected outright: there is no
//! migration path for the old schema, and failing fast here beats a
//! best-effort upgrade that guesses wrong.

use mira_common::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

/// Root element of the current descriptor schema.
pub const DESCRIPTOR_ROOT: &str = "Reconcile";

/// Deprecated pre-consolidation root element names. Hard stop on sight.
pub const DEPRECATED_ROOTS: [&str; 3] = ["MergeStudy", "CreateStudy", "Discard"];

/// The resolution strategy recorded in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileAction {
    CreateNewStudy,
    Discard,
    Merge,
    ProcessAsIs,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::CreateNewStudy => "CreateNewStudy",
            ReconcileAction::Discard => "Discard",
            ReconcileAction::Merge => "Merge",
            ReconcileAction::ProcessAsIs => "ProcessAsIs",
        }
    }
}

/// One attribute override applied to every reconciled instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEdit {
    #[serde(rename = "Tag")]
    pub tag: String,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEdits {
    #[serde(rename = "TagEdit", default)]
    pub edits: Vec<TagEdit>,
}

/// Source-to-target series association chosen by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMapping {
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Target")]
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMappings {
    #[serde(rename = "SeriesMapping", default)]
    pub mappings: Vec<SeriesMapping>,
}

/// Persisted action descriptor (current schema).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "Reconcile")]
pub struct StudyReconcileDescriptor {
    #[serde(rename = "Action")]
    pub action: ReconcileAction,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// True when the decision was made by auto-reconciliation rather than
    /// an operator.
    #[serde(rename = "Automatic", default)]
    pub automatic: bool,
    #[serde(rename = "TagEdits", default)]
    pub tag_edits: TagEdits,
    #[serde(rename = "SeriesMappings", default)]
    pub series_mappings: SeriesMappings,
}

impl StudyReconcileDescriptor {
    pub fn new(action: ReconcileAction) -> Self {
        Self {
            action,
            description: None,
            automatic: false,
            tag_edits: TagEdits::default(),
            series_mappings: SeriesMappings::default(),
        }
    }

    /// Explicit series mapping for a source series uid, if the descriptor
    /// carries one.
    pub fn series_mapping(&self, source: &str) -> Option<&SeriesMapping> {
        self.series_mappings
            .mappings
            .iter()
            .find(|m| m.source == source)
    }

    /// Serialize back to the current XML schema.
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize descriptor: {}", e)))
    }
}

/// Parser for persisted descriptors.
pub struct StudyReconcileDescriptorParser;

impl StudyReconcileDescriptorParser {
    /// Parse a descriptor document.
    ///
    /// Only the current schema is accepted. Deprecated roots and unknown
    /// roots fail with [`Error::UnsupportedFormat`]; so does an action
    /// value outside the four known strategies.
    pub fn parse(xml: &str) -> Result<StudyReconcileDescriptor> {
        let root = root_element_name(xml)?;

        if DEPRECATED_ROOTS.contains(&root.as_str()) {
            return Err(Error::UnsupportedFormat(format!(
                "Descriptor root '{}' belongs to a deprecated schema and is no longer supported",
                root
            )));
        }

        if root != DESCRIPTOR_ROOT {
            return Err(Error::UnsupportedFormat(format!(
                "Unrecognized descriptor root '{}'",
                root
            )));
        }

        quick_xml::de::from_str(xml)
            .map_err(|e| Error::UnsupportedFormat(format!("Malformed descriptor: {}", e)))
    }
}

fn root_element_name(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.name();
                return String::from_utf8(name.as_ref().to_vec())
                    .map_err(|_| Error::UnsupportedFormat("Non-UTF8 root element".to_string()));
            }
            Ok(Event::Eof) => {
                return Err(Error::UnsupportedFormat(
                    "Descriptor document has no root element".to_string(),
                ))
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(Error::UnsupportedFormat(format!(
                    "Malformed descriptor: {}",
                    e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_schema_parses() {
        let xml = r#"
            <Reconcile>
                <Action>Merge</Action>
                <Description>Operator approved merge</Description>
                <TagEdits>
                    <TagEdit><Tag>PatientName</Tag><Value>DOE^JANE</Value></TagEdit>
                </TagEdits>
                <SeriesMappings>
                    <SeriesMapping><Source>1.2.3.1</Source><Target>4.5.6.1</Target></SeriesMapping>
                </SeriesMappings>
            </Reconcile>"#;

        let descriptor = StudyReconcileDescriptorParser::parse(xml).unwrap();
        assert_eq!(descriptor.action, ReconcileAction::Merge);
        assert!(!descriptor.automatic);
        assert_eq!(descriptor.tag_edits.edits.len(), 1);
        assert_eq!(
            descriptor.series_mapping("1.2.3.1").unwrap().target,
            "4.5.6.1"
        );
    }

    #[test]
    fn minimal_descriptor_parses() {
        let descriptor =
            StudyReconcileDescriptorParser::parse("<Reconcile><Action>Discard</Action></Reconcile>")
                .unwrap();
        assert_eq!(descriptor.action, ReconcileAction::Discard);
        assert!(descriptor.tag_edits.edits.is_empty());
    }

    #[test]
    fn deprecated_roots_are_rejected() {
        for root in DEPRECATED_ROOTS {
            let xml = format!("<{root}><Action>Merge</Action></{root}>");
            let err = StudyReconcileDescriptorParser::parse(&xml).unwrap_err();
            match err {
                Error::UnsupportedFormat(reason) => assert!(reason.contains(root)),
                other => panic!("expected UnsupportedFormat, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_root_is_rejected() {
        let err = StudyReconcileDescriptorParser::parse("<Frobnicate/>").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn unknown_action_fails_fast() {
        let err = StudyReconcileDescriptorParser::parse(
            "<Reconcile><Action>SplitStudy</Action></Reconcile>",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn round_trips_through_xml() {
        let mut descriptor = StudyReconcileDescriptor::new(ReconcileAction::CreateNewStudy);
        descriptor.series_mappings.mappings.push(SeriesMapping {
            source: "1.2.3.1".to_string(),
            target: "9.9.9.1".to_string(),
        });

        let xml = descriptor.to_xml().unwrap();
        let parsed = StudyReconcileDescriptorParser::parse(&xml).unwrap();
        assert_eq!(parsed, descriptor);
    }
}
