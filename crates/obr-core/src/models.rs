//! Domain models for resources, elements, concepts, and annotations.

use serde::{Deserialize, Serialize};

use crate::workflow::{DirectStatus, ExpandedStatus};

// =============================================================================
// RESOURCES AND CONTEXTS
// =============================================================================

/// An annotated resource registered by a resource adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Short uppercase code, e.g. `GEO`.
    pub resource_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Context used as the element's headline, e.g. `GEO_title`.
    pub main_context: Option<String>,
    /// Last dictionary version the resource's elements were annotated with.
    pub last_dictionary_version: Option<i32>,
}

/// How the values of a context are annotated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ontology_id", rename_all = "snake_case")]
pub enum ContextKind {
    /// Free text subject to term matching.
    ForConceptRecognition,
    /// Values are concept references from the given ontology, reported by the
    /// source itself.
    BoundOntology(String),
    /// Carried for display only.
    NotForAnnotation,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForConceptRecognition => "for_concept_recognition",
            Self::BoundOntology(_) => "bound_ontology",
            Self::NotForAnnotation => "not_for_annotation",
        }
    }

    /// Ontology the context is bound to, if any.
    pub fn bound_ontology(&self) -> Option<&str> {
        match self {
            Self::BoundOntology(id) => Some(id),
            _ => None,
        }
    }

    /// Rebuild from the stored kind string and optional ontology column.
    pub fn from_parts(kind: &str, ontology_id: Option<String>) -> Result<Self, String> {
        match (kind, ontology_id) {
            ("for_concept_recognition", _) => Ok(Self::ForConceptRecognition),
            ("not_for_annotation", _) => Ok(Self::NotForAnnotation),
            ("bound_ontology", Some(id)) if !id.is_empty() => Ok(Self::BoundOntology(id)),
            ("bound_ontology", _) => Err("bound_ontology context without ontology id".to_string()),
            (other, _) => Err(format!("Invalid context kind: {}", other)),
        }
    }
}

/// A named, weighted slot of an element's structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Unique per resource, e.g. `GEO_title`.
    pub name: String,
    pub resource_id: String,
    /// Relevance weight multiplied into every score from this context.
    pub weight: f64,
    pub kind: ContextKind,
}

impl Context {
    pub fn new(
        resource_id: impl Into<String>,
        name: impl Into<String>,
        weight: f64,
        kind: ContextKind,
    ) -> Self {
        Self {
            name: name.into(),
            resource_id: resource_id.into(),
            weight,
            kind,
        }
    }
}

/// One content unit of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: i64,
    pub resource_id: String,
    pub local_element_id: String,
    pub dictionary_version: Option<i32>,
}

// =============================================================================
// CONCEPTS
// =============================================================================

/// A globally unique concept reference.
///
/// The textual form is `<ontology_id>/<code>`. The code may itself contain
/// `/`; the ontology id may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConceptRef {
    pub ontology_id: String,
    pub code: String,
}

impl ConceptRef {
    pub fn new(ontology_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            ontology_id: ontology_id.into(),
            code: code.into(),
        }
    }
}

impl std::fmt::Display for ConceptRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ontology_id, self.code)
    }
}

impl std::str::FromStr for ConceptRef {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ontology, code)) if !ontology.trim().is_empty() && !code.trim().is_empty() => {
                Ok(Self::new(ontology, code))
            }
            _ => Err(crate::Error::MalformedConcept(s.to_string())),
        }
    }
}

/// How a direct annotation was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermKind {
    /// Reported by the source content (bound-ontology context).
    Reported,
    /// Dictionary match on a concept's preferred name.
    PreferredTerm,
    /// Dictionary match on a synonym.
    SynonymTerm,
}

impl TermKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reported => "reported",
            Self::PreferredTerm => "preferred_term",
            Self::SynonymTerm => "synonym_term",
        }
    }
}

impl std::fmt::Display for TermKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TermKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reported" => Ok(Self::Reported),
            "preferred_term" => Ok(Self::PreferredTerm),
            "synonym_term" => Ok(Self::SynonymTerm),
            _ => Err(format!("Invalid term kind: {}", s)),
        }
    }
}

/// Kind of cross-ontology mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// Same identifier shared across ontologies.
    SameIdentity,
    /// Curated mapping relation.
    ExplicitRelation,
}

impl MappingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SameIdentity => "same_identity",
            Self::ExplicitRelation => "explicit_relation",
        }
    }
}

impl std::fmt::Display for MappingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MappingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "same_identity" => Ok(Self::SameIdentity),
            "explicit_relation" => Ok(Self::ExplicitRelation),
            _ => Err(format!("Invalid mapping type: {}", s)),
        }
    }
}

/// `ancestor` is an is-a ancestor of `concept` at minimal distance `level`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentEdge {
    pub concept: ConceptRef,
    pub ancestor: ConceptRef,
    pub level: i32,
}

/// `target` is considered equivalent or related to `concept`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingEdge {
    pub concept: ConceptRef,
    pub target: ConceptRef,
    pub mapping_type: MappingType,
}

// =============================================================================
// ANNOTATIONS
// =============================================================================

/// An observed element-concept association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectAnnotation {
    pub id: i64,
    pub element_id: i64,
    /// Concept reference as recorded by the tagger; parsed by each stage.
    pub concept: String,
    pub context: String,
    pub term_kind: TermKind,
    /// Dictionary term that matched; `None` for reported annotations.
    pub term_id: Option<String>,
    pub status: DirectStatus,
}

/// Direct annotation as supplied by the tagging stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDirectAnnotation {
    pub local_element_id: String,
    pub concept: String,
    pub context: String,
    pub term_kind: TermKind,
    pub term_id: Option<String>,
}

impl NewDirectAnnotation {
    /// Annotation reported by the source in a bound-ontology context.
    pub fn reported(
        local_element_id: impl Into<String>,
        concept: &ConceptRef,
        context: impl Into<String>,
    ) -> Self {
        Self {
            local_element_id: local_element_id.into(),
            concept: concept.to_string(),
            context: context.into(),
            term_kind: TermKind::Reported,
            term_id: None,
        }
    }

    /// Annotation produced by dictionary matching.
    pub fn matched(
        local_element_id: impl Into<String>,
        concept: &ConceptRef,
        context: impl Into<String>,
        term_kind: TermKind,
        term_id: impl Into<String>,
    ) -> Self {
        Self {
            local_element_id: local_element_id.into(),
            concept: concept.to_string(),
            context: context.into(),
            term_kind,
            term_id: Some(term_id.into()),
        }
    }
}

/// Which relation produced an expanded annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionType {
    IsaClosure,
    Mapping,
}

impl ExpansionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IsaClosure => "isa_closure",
            Self::Mapping => "mapping",
        }
    }
}

impl std::fmt::Display for ExpansionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExpansionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isa_closure" => Ok(Self::IsaClosure),
            "mapping" => Ok(Self::Mapping),
            _ => Err(format!("Invalid expansion type: {}", s)),
        }
    }
}

/// Expansion type together with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expansion {
    /// Ancestor at `level` steps up the is-a hierarchy.
    IsaClosure { level: i32 },
    /// Mapped concept.
    Mapping { mapping_type: MappingType },
}

impl Expansion {
    pub fn expansion_type(&self) -> ExpansionType {
        match self {
            Self::IsaClosure { .. } => ExpansionType::IsaClosure,
            Self::Mapping { .. } => ExpansionType::Mapping,
        }
    }

    pub fn level(&self) -> Option<i32> {
        match self {
            Self::IsaClosure { level } => Some(*level),
            Self::Mapping { .. } => None,
        }
    }

    pub fn mapping_type(&self) -> Option<MappingType> {
        match self {
            Self::IsaClosure { .. } => None,
            Self::Mapping { mapping_type } => Some(*mapping_type),
        }
    }
}

/// A derived element-concept association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedAnnotation {
    pub id: i64,
    pub element_id: i64,
    pub concept: String,
    pub context: String,
    pub origin_concept: String,
    pub expansion: Expansion,
    pub status: ExpandedStatus,
}

/// Expanded annotation emitted by an expander, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpandedAnnotation {
    pub element_id: i64,
    pub concept: String,
    pub context: String,
    pub origin_concept: String,
    pub expansion: Expansion,
}

// =============================================================================
// SCORES
// =============================================================================

/// Final weighted relevance of a concept for an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedScore {
    pub element_id: i64,
    pub concept: String,
    pub score: f64,
}

/// Score added to an (element, concept) pair by one aggregation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreContribution {
    pub element_id: i64,
    pub concept: String,
    pub score: f64,
}

/// Scored concept for an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementConceptScore {
    pub concept: String,
    pub score: f64,
}

/// Element scored for a concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptElementScore {
    pub resource_id: String,
    pub local_element_id: String,
    pub score: f64,
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Annotation counts for one ontology within one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologyStatistics {
    pub ontology_id: String,
    pub direct_annotations: i64,
    pub isa_annotations: i64,
    pub mapping_annotations: i64,
    pub aggregated_scores: i64,
}

/// Row counts per workflow status for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub direct: Vec<(DirectStatus, i64)>,
    pub expanded: Vec<(ExpandedStatus, i64)>,
}

impl StatusCounts {
    pub fn direct_in(&self, status: DirectStatus) -> i64 {
        self.direct
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn expanded_in(&self, status: ExpandedStatus) -> i64 {
        self.expanded
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_ref_parse() {
        let c: ConceptRef = "1032/Melanoma".parse().unwrap();
        assert_eq!(c.ontology_id, "1032");
        assert_eq!(c.code, "Melanoma");
        assert_eq!(c.to_string(), "1032/Melanoma");
    }

    #[test]
    fn test_concept_ref_code_may_contain_slash() {
        let c: ConceptRef = "GO/http://purl/GO_0008150".parse().unwrap();
        assert_eq!(c.ontology_id, "GO");
        assert_eq!(c.code, "http://purl/GO_0008150");
    }

    #[test]
    fn test_concept_ref_malformed() {
        for raw in ["", "NCI", "/C123", "NCI/", " /x"] {
            let err = raw.parse::<ConceptRef>().unwrap_err();
            assert!(matches!(err, crate::Error::MalformedConcept(_)), "{raw}");
        }
    }

    #[test]
    fn test_context_kind_from_parts() {
        assert_eq!(
            ContextKind::from_parts("bound_ontology", Some("1353".into())).unwrap(),
            ContextKind::BoundOntology("1353".into())
        );
        assert_eq!(
            ContextKind::from_parts("for_concept_recognition", None).unwrap(),
            ContextKind::ForConceptRecognition
        );
        assert!(ContextKind::from_parts("bound_ontology", None).is_err());
        assert!(ContextKind::from_parts("free_text", None).is_err());
    }

    #[test]
    fn test_expansion_accessors() {
        let isa = Expansion::IsaClosure { level: 2 };
        assert_eq!(isa.expansion_type(), ExpansionType::IsaClosure);
        assert_eq!(isa.level(), Some(2));
        assert_eq!(isa.mapping_type(), None);

        let map = Expansion::Mapping {
            mapping_type: MappingType::SameIdentity,
        };
        assert_eq!(map.expansion_type(), ExpansionType::Mapping);
        assert_eq!(map.mapping_type(), Some(MappingType::SameIdentity));
        assert_eq!(map.level(), None);
    }

    #[test]
    fn test_expansion_serde_tagged() {
        let json = serde_json::to_value(Expansion::IsaClosure { level: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "isa_closure", "level": 3}));
    }

    #[test]
    fn test_new_direct_annotation_constructors() {
        let c = ConceptRef::new("NCI", "C3224");
        let reported = NewDirectAnnotation::reported("GSE1", &c, "GEO_organism");
        assert_eq!(reported.term_kind, TermKind::Reported);
        assert!(reported.term_id.is_none());
        assert_eq!(reported.concept, "NCI/C3224");

        let matched =
            NewDirectAnnotation::matched("GSE1", &c, "GEO_title", TermKind::SynonymTerm, "t-9");
        assert_eq!(matched.term_id.as_deref(), Some("t-9"));
    }

    #[test]
    fn test_enum_string_roundtrip() {
        for kind in [
            TermKind::Reported,
            TermKind::PreferredTerm,
            TermKind::SynonymTerm,
        ] {
            assert_eq!(kind.as_str().parse::<TermKind>().unwrap(), kind);
        }
        for mt in [MappingType::SameIdentity, MappingType::ExplicitRelation] {
            assert_eq!(mt.as_str().parse::<MappingType>().unwrap(), mt);
        }
    }

    #[test]
    fn test_status_counts_lookup() {
        let counts = StatusCounts {
            direct: vec![(DirectStatus::MappingDone, 4)],
            expanded: vec![(ExpandedStatus::Indexed, 9)],
        };
        assert_eq!(counts.direct_in(DirectStatus::MappingDone), 4);
        assert_eq!(counts.direct_in(DirectStatus::IndexingDone), 0);
        assert_eq!(counts.expanded_in(ExpandedStatus::Indexed), 9);
    }
}
