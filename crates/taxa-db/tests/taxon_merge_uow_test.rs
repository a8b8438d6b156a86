use taxa_core::{
    Rank, RelationClass, TaxonRepository, TaxonomicStatus, VernacularName, WriteContext,
};
use taxa_db::test_fixtures::{connect_test_database, unique_name, TestDataBuilder};

fn vernacular(name: &str) -> VernacularName {
    VernacularName {
        name: name.to_string(),
        language: Some("eng".to_string()),
        source: None,
    }
}

#[tokio::test]
async fn test_merge_candidates_match_canonical_and_legacy_names() {
    let Some(db) = connect_test_database().await else {
        return;
    };
    let builder = TestDataBuilder::new(&db);
    let name = unique_name("Panthera");

    let exact = builder.taxon(&name, Rank::Genus).await;
    let mut aliased = builder.taxon(&unique_name("Tigris"), Rank::Genus).await;
    aliased.add_legacy_name(&name);
    db.taxa
        .update(WriteContext::interactive(), &aliased)
        .await
        .expect("update");
    // Same name, different rank: never a candidate.
    builder.taxon(&name, Rank::Species).await;

    let candidates = db
        .taxa
        .find_merge_candidates(&name.to_uppercase(), Rank::Genus)
        .await
        .expect("candidates");
    let ids: Vec<i64> = candidates.iter().map(|t| t.id).collect();
    assert!(ids.contains(&exact.id));
    assert!(ids.contains(&aliased.id));
    assert_eq!(ids.len(), 2);
}

#[tokio::test]
async fn test_unit_of_work_repoints_and_deletes_losers() {
    let Some(db) = connect_test_database().await else {
        return;
    };
    let builder = TestDataBuilder::new(&db);
    let name = unique_name("Panthera tigris");

    let survivor = builder.taxon(&name, Rank::Species).await;
    let loser = builder.taxon(&name, Rank::Species).await;
    let mut child = builder.taxon(&unique_name("Panthera tigris altaica"), Rank::Subspecies).await;
    child.parent_id = Some(loser.id);
    db.taxa
        .update(WriteContext::interactive(), &child)
        .await
        .expect("update child");

    db.taxa
        .add_vernacular_names(survivor.id, &[vernacular("Tiger")])
        .await
        .expect("survivor names");
    db.taxa
        .add_vernacular_names(loser.id, &[vernacular("tiger"), vernacular("Bengal tiger")])
        .await
        .expect("loser names");

    let mut uow = db.taxa.begin().await.expect("begin");
    for class in RelationClass::ALL {
        uow.migrate_references(class, &[loser.id], survivor.id)
            .await
            .expect("migrate");
    }
    assert_eq!(uow.delete_taxa(&[loser.id]).await.expect("delete"), 1);
    uow.commit().await.expect("commit");

    assert!(db.taxa.get(loser.id).await.expect("get").is_none());
    let names = db.taxa.vernacular_names(survivor.id).await.expect("names");
    assert_eq!(names.len(), 2, "colliding name dropped, distinct name kept");
    let child = db.taxa.get(child.id).await.expect("get").expect("child");
    assert_eq!(child.parent_id, Some(survivor.id));
    for class in RelationClass::ALL {
        assert_eq!(
            db.taxa.count_references(class, loser.id).await.expect("count"),
            0
        );
    }
}

#[tokio::test]
async fn test_rollback_discards_unit_of_work() {
    let Some(db) = connect_test_database().await else {
        return;
    };
    let builder = TestDataBuilder::new(&db);
    let name = unique_name("Felis");
    let keep = builder
        .taxon_with(&name, Rank::Genus, TaxonomicStatus::Accepted, None)
        .await;

    let mut uow = db.taxa.begin().await.expect("begin");
    uow.delete_taxa(&[keep.id]).await.expect("delete");
    uow.rollback().await.expect("rollback");

    assert!(db.taxa.get(keep.id).await.expect("get").is_some());
}

#[tokio::test]
async fn test_vernacular_names_are_idempotent() {
    let Some(db) = connect_test_database().await else {
        return;
    };
    let taxon = TestDataBuilder::new(&db)
        .taxon(&unique_name("Acinonyx jubatus"), Rank::Species)
        .await;

    let names = [vernacular("Cheetah")];
    assert_eq!(db.taxa.add_vernacular_names(taxon.id, &names).await.unwrap(), 1);
    assert_eq!(db.taxa.add_vernacular_names(taxon.id, &names).await.unwrap(), 0);
}
