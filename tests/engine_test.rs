use std::sync::Arc;

use oxipipe::{
    DateRange, LookupBuilder, MacroRegistry, MemoryDb, PaginationOptions, ProjectBuilder, SortBuilder, Stage, aggregator,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn articles(n: usize) -> MemoryDb {
    let db = MemoryDb::new();
    let docs = (1..=n)
        .map(|i| json!({"n": i, "published": i % 5 != 0, "createdAt": format!("2024-01-{i:02}T12:00:00Z")}))
        .collect();
    db.insert_many("articles", docs).unwrap();
    db
}

#[test]
fn second_page_of_twenty_five() {
    let db = articles(25);
    let coll = db.collection("articles");
    let mut agg = aggregator(&coll);
    agg.sort(json!({"n": 1}))
        .paginate(PaginationOptions::new(2, 10));
    let out = agg.exec().unwrap();

    assert_eq!(out.len(), 1);
    let page = &out[0];
    assert_eq!(
        page["metaData"],
        json!({
            "totalDocs": 25,
            "totalPages": 3,
            "hasNextPage": true,
            "hasPrevPage": true,
            "page": 2,
            "perPage": 10
        })
    );
    let data = page["data"].as_array().unwrap();
    assert_eq!(data.len(), 10);
    assert_eq!(data[0]["n"], 11);
    assert_eq!(data[9]["n"], 20);
}

#[test]
fn last_page_has_no_next() {
    let db = articles(25);
    let coll = db.collection("articles");
    let mut agg = aggregator(&coll);
    agg.sort(json!({"n": 1}))
        .paginate(PaginationOptions::new(3, 10));
    let out = agg.exec().unwrap();

    assert_eq!(out[0]["metaData"]["hasNextPage"], false);
    assert_eq!(out[0]["metaData"]["hasPrevPage"], true);
    let data = out[0]["data"].as_array().unwrap();
    assert_eq!(data.len(), 5);
    assert_eq!(data[0]["n"], 21);
}

#[test]
fn first_page_has_next() {
    let db = articles(25);
    let coll = db.collection("articles");
    let mut agg = aggregator(&coll);
    agg.paginate(PaginationOptions::default());
    let out = agg.exec().unwrap();

    assert_eq!(out[0]["metaData"]["hasNextPage"], true);
    assert_eq!(out[0]["metaData"]["hasPrevPage"], false);
    assert_eq!(out[0]["data"].as_array().unwrap().len(), 10);
}

#[test]
fn empty_collection_page() {
    let db = MemoryDb::new();
    let coll = db.collection("articles");
    let mut agg = aggregator(&coll);
    agg.paginate(PaginationOptions::new(1, 5));
    let out = agg.exec().unwrap();

    assert_eq!(
        out,
        vec![json!({
            "data": [],
            "metaData": {
                "totalPages": null,
                "hasNextPage": false,
                "hasPrevPage": false,
                "page": 1,
                "perPage": 5
            }
        })]
    );
}

#[test]
fn filters_merge_before_pagination() {
    let db = articles(25);
    let coll = db.collection("articles");
    let mut agg = aggregator(&coll);
    agg.filter(json!({"published": true}))
        .date_range(DateRange::parse("createdAt", Some("2024-01-01"), Some("2024-01-10")).unwrap())
        .paginate(PaginationOptions::new(1, 3));

    assert_eq!(agg.len(), 4);
    let out = agg.exec().unwrap();
    // Days 1..=9 fall inside the range; day 5 is unpublished.
    assert_eq!(out[0]["metaData"]["totalDocs"], 8);
    assert_eq!(out[0]["metaData"]["totalPages"], 3);
}

#[test]
fn exclusive_date_range_drops_bounds() {
    let db = MemoryDb::new();
    db.insert_many(
        "events",
        vec![
            json!({"at": "2024-03-01T00:00:00Z"}),
            json!({"at": "2024-03-02T00:00:00Z"}),
            json!({"at": "2024-03-03T00:00:00Z"}),
        ],
    )
    .unwrap();

    let coll = db.collection("events");
    let mut agg = aggregator(&coll);
    agg.date_range(
        DateRange::parse("at", Some("2024-03-01"), Some("2024-03-03"))
            .unwrap()
            .inclusive(false),
    );
    let out = agg.exec().unwrap();
    assert_eq!(out, vec![json!({"at": "2024-03-02T00:00:00Z"})]);
}

#[test]
fn macro_conditional_and_join_end_to_end() {
    let db = MemoryDb::new();
    db.insert_many(
        "users",
        vec![
            json!({"_id": 1, "name": "ana", "role": "admin"}),
            json!({"_id": 2, "name": "ben", "role": "user"}),
        ],
    )
    .unwrap();
    db.insert_many(
        "posts",
        vec![
            json!({"author": 1, "title": "a"}),
            json!({"author": 1, "title": "b"}),
            json!({"author": 2, "title": "c"}),
        ],
    )
    .unwrap();

    let reg = Arc::new(MacroRegistry::new());
    reg.register("withPosts", |_: &[Value]| {
        let body = LookupBuilder::new()
            .from("posts")
            .local_field("_id")
            .foreign_field("author")
            .as_field("posts")
            .build();
        Stage::Lookup(body)
    })
    .unwrap();

    let only_admins = true;
    let coll = db.collection("users");
    let mut agg = aggregator(&coll).with_registry(reg);
    agg.when(only_admins, |p| {
        p.filter(json!({"role": "admin"}));
    })
    .use_macro("withPosts", &[])
    .unwrap()
    .project(ProjectBuilder::new().exclude("_id").exclude("role"))
    .sort(SortBuilder::new().asc("name"));

    let out = agg.exec().unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0]["name"], "ana");
    assert_eq!(out[0]["posts"].as_array().unwrap().len(), 2);
    assert!(out[0].get("role").is_none());
}

#[test]
fn engine_errors_surface_from_exec() {
    let db = MemoryDb::new();
    let coll = db.collection("anything");
    let mut agg = aggregator(&coll);
    agg.merge_output(json!({"into": "elsewhere"}));
    assert!(matches!(agg.exec(), Err(oxipipe::Error::InvalidPipeline(_))));
}
