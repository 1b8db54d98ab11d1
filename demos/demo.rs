use std::sync::Arc;

use oxipipe::{
    DateRange, GroupBuilder, MacroRegistry, MemoryDb, PaginationOptions, SortBuilder, aggregator,
};
use serde_json::{Value, json};

fn main() -> oxipipe::Result<()> {
    let db = MemoryDb::new();
    db.insert_many(
        "orders",
        vec![
            json!({"customer": "acme", "total": 120, "status": "paid", "placedAt": "2024-02-03T10:00:00Z"}),
            json!({"customer": "acme", "total": 80, "status": "paid", "placedAt": "2024-02-11T09:30:00Z"}),
            json!({"customer": "globex", "total": 45, "status": "refunded", "placedAt": "2024-02-14T16:00:00Z"}),
            json!({"customer": "initech", "total": 300, "status": "paid", "placedAt": "2024-03-01T08:00:00Z"}),
        ],
    )?;

    let macros = Arc::new(MacroRegistry::new());
    macros.register("revenueByCustomer", |_: &[Value]| {
        vec![
            json!({"$group": GroupBuilder::new("$customer").add("revenue", json!({"$sum": "$total"})).build()}),
            json!({"$sort": SortBuilder::new().desc("revenue").build()}),
        ]
    })?;

    let only_paid = true;
    let orders = db.collection("orders");
    let mut agg = aggregator(&orders).with_registry(macros);
    agg.when(only_paid, |p| {
        p.filter(json!({"status": "paid"}));
    })
    .date_range(DateRange::parse("placedAt", Some("2024-02-01"), Some("2024-02-29"))?)
    .use_macro("revenueByCustomer", &[])?
    .paginate(PaginationOptions::new(1, 10));

    println!("pipeline: {}", serde_json::to_string_pretty(&agg.to_json())?);
    let result = agg.exec()?;
    println!("result: {}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
