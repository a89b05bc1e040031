//! Integration tests for the PostgreSQL annotation store.
//!
//! **IMPORTANT**: These tests require a fully migrated PostgreSQL database.
//! Run migrations first: `obr-workflow migrate`

use obr_db::test_fixtures::{connect_test, unique_resource_id, TestResource};
use obr_db::{
    AggregationCommit, AnnotationStore, ConceptRef, ContextKind, DirectAnnotationRepository,
    DirectStatus, Error, Expansion, ExpansionCommit, ExpansionType, MaintenanceRepository,
    MappingEdge, MappingType, NewDirectAnnotation, NewExpandedAnnotation, OntologyRelations,
    ParentEdge, ResourceRepository, ScoreContribution, ScoreRepository, Stage, TermKind,
};

fn fixture() -> TestResource {
    TestResource::new(unique_resource_id("store"))
        .with_context("title", 1.0, ContextKind::ForConceptRecognition)
        .with_context("mesh", 0.5, ContextKind::BoundOntology("MSH".into()))
        .with_elements(["E1", "E2"])
}

fn c(s: &str) -> ConceptRef {
    s.parse().unwrap()
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_add_direct_skips_duplicates_and_unknown_rows() {
    let db = connect_test().await;
    let fx = fixture();
    fx.install(&db).await;

    let rows = vec![
        NewDirectAnnotation::matched("E1", &c("GO/1"), "title", TermKind::PreferredTerm, "t1"),
        NewDirectAnnotation::matched("E1", &c("GO/1"), "title", TermKind::PreferredTerm, "t1"),
        NewDirectAnnotation::matched("E9", &c("GO/1"), "title", TermKind::PreferredTerm, "t1"),
        NewDirectAnnotation::matched("E1", &c("GO/1"), "nope", TermKind::PreferredTerm, "t1"),
        NewDirectAnnotation::reported("E2", &c("MSH/D1"), "mesh"),
    ];
    let inserted = db
        .direct_annotations
        .add_direct_annotations(fx.id(), &rows)
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let counts = db.direct_annotations.status_counts(fx.id()).await.unwrap();
    assert_eq!(counts.direct_in(DirectStatus::DirectAnnotationDone), 2);

    fx.cleanup(&db).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_commit_expansion_is_guarded_by_input_state() {
    let db = connect_test().await;
    let fx = fixture();
    fx.install(&db).await;

    db.direct_annotations
        .add_direct_annotations(
            fx.id(),
            &[NewDirectAnnotation::matched(
                "E1",
                &c("GO/1"),
                "title",
                TermKind::PreferredTerm,
                "t1",
            )],
        )
        .await
        .unwrap();

    let batch = db
        .store
        .direct_batch(fx.id(), DirectStatus::DirectAnnotationDone, 100)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);

    let commit = ExpansionCommit {
        resource_id: fx.id().to_string(),
        stage: Stage::IsaClosure,
        consumed: vec![batch[0].id],
        emitted: vec![NewExpandedAnnotation {
            element_id: batch[0].element_id,
            concept: "GO/0".into(),
            context: "title".into(),
            origin_concept: "GO/1".into(),
            expansion: Expansion::IsaClosure { level: 1 },
        }],
    };
    assert_eq!(db.store.commit_expansion(&commit).await.unwrap(), 1);

    // Replaying the same commit must not duplicate the expanded row.
    let replay = db.store.commit_expansion(&commit).await;
    assert!(matches!(replay, Err(Error::Internal(_))));

    let pending = db
        .store
        .pending_expanded_batch(fx.id(), ExpansionType::IsaClosure, 100)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].expansion, Expansion::IsaClosure { level: 1 });

    fx.cleanup(&db).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_aggregation_adds_onto_existing_scores() {
    let db = connect_test().await;
    let fx = fixture();
    fx.install(&db).await;

    let element_id: i64 = sqlx::query_scalar(
        "SELECT id FROM obr_element WHERE resource_id = $1 AND local_element_id = 'E1'",
    )
    .bind(fx.id())
    .fetch_one(db.pool())
    .await
    .unwrap();

    for score in [4.0, 6.0] {
        let commit = AggregationCommit {
            resource_id: fx.id().to_string(),
            contributions: vec![ScoreContribution {
                element_id,
                concept: "GO/1".into(),
                score,
            }],
            ..Default::default()
        };
        db.store.commit_aggregation(&commit).await.unwrap();
    }

    let scores = db.scores.scores_for_element(fx.id(), "E1").await.unwrap();
    assert_eq!(scores.len(), 1);
    assert!((scores[0].score - 10.0).abs() < 1e-9);
    assert_eq!(db.store.aggregated_count(fx.id()).await.unwrap(), 1);

    let hits = db.scores.scores_for_concept(&c("GO/1"), 10).await.unwrap();
    assert!(hits
        .iter()
        .any(|h| h.resource_id == fx.id() && h.local_element_id == "E1"));

    fx.cleanup(&db).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_delete_resource_removes_everything() {
    let db = connect_test().await;
    let fx = fixture();
    fx.install(&db).await;

    db.direct_annotations
        .add_direct_annotations(fx.id(), &[NewDirectAnnotation::reported("E2", &c("MSH/D1"), "mesh")])
        .await
        .unwrap();

    assert!(db.maintenance.delete_resource(fx.id()).await.unwrap());
    assert!(db.resources.get_resource(fx.id()).await.unwrap().is_none());
    let counts = db.direct_annotations.status_counts(fx.id()).await.unwrap();
    assert!(counts.direct.is_empty());
}

fn parent(concept: &ConceptRef, ancestor: &ConceptRef, level: i32) -> ParentEdge {
    ParentEdge {
        concept: concept.clone(),
        ancestor: ancestor.clone(),
        level,
    }
}

async fn drop_relations(db: &obr_db::Database, ontology: &str) {
    for table in ["obr_relation_is_a", "obr_relation_mapping"] {
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE split_part(concept, '/', 1) = $1"
        ))
        .bind(ontology)
        .execute(db.pool())
        .await
        .unwrap();
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_reloaded_parent_edge_keeps_smallest_level() {
    let db = connect_test().await;
    let ontology = unique_resource_id("ISA");
    let child = ConceptRef::new(&ontology, "child");
    let root = ConceptRef::new(&ontology, "root");
    let mid = ConceptRef::new(&ontology, "mid");

    db.relations
        .load_parents(&[parent(&child, &root, 3), parent(&child, &mid, 1)])
        .await
        .unwrap();
    // Same edge twice in one call and once more against the stored row.
    db.relations
        .load_parents(&[parent(&child, &root, 4), parent(&child, &root, 2)])
        .await
        .unwrap();
    db.relations
        .load_parents(&[parent(&child, &mid, 5)])
        .await
        .unwrap();

    let edges = db.relations.parents_of(&[child.clone()]).await.unwrap();
    assert_eq!(
        edges,
        vec![parent(&child, &mid, 1), parent(&child, &root, 2)]
    );

    drop_relations(&db, &ontology).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_reloaded_mapping_edge_is_ignored() {
    let db = connect_test().await;
    let ontology = unique_resource_id("MAP");
    let edge = MappingEdge {
        concept: ConceptRef::new(&ontology, "a"),
        target: c("MSH/D1"),
        mapping_type: MappingType::SameIdentity,
    };

    assert_eq!(db.relations.load_mappings(&[edge.clone()]).await.unwrap(), 1);
    assert_eq!(db.relations.load_mappings(&[edge.clone()]).await.unwrap(), 0);
    assert_eq!(
        db.relations.mappings_of(&[edge.concept.clone()]).await.unwrap(),
        vec![edge]
    );

    drop_relations(&db, &ontology).await;
}
