use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::stage::Stage;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PER_PAGE: u64 = 10;

/// Page request. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaginationOptions {
    pub page: u64,
    pub per_page: u64,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl PaginationOptions {
    pub fn new(page: u64, per_page: u64) -> Self {
        Self { page, per_page }
    }

    pub fn page(mut self, page: u64) -> Self {
        self.page = page;
        self
    }

    pub fn per_page(mut self, per_page: u64) -> Self {
        self.per_page = per_page;
        self
    }
}

/// Build the three-stage pagination tail.
///
/// The output documents have the shape
/// `{data: [...], metaData: {totalDocs, totalPages, hasNextPage, hasPrevPage, page, perPage}}`
/// where `page` and `perPage` are baked in as literals. `totalDocs` is absent
/// when nothing matched. A page below 1 is treated as page 1.
pub fn paginate(opts: PaginationOptions) -> Vec<Stage> {
    let page = opts.page.max(1);
    let per_page = opts.per_page;
    let skip = (page - 1).saturating_mul(per_page);
    let total = json!({"$arrayElemAt": ["$meta.totalDocs", 0]});

    vec![
        Stage::Facet(json!({
            "data": [
                {"$skip": skip},
                {"$limit": per_page}
            ],
            "meta": [
                {"$count": "totalDocs"}
            ]
        })),
        Stage::AddFields(json!({
            "totalDocs": total,
            "totalPages": {"$ceil": {"$divide": [total, per_page]}},
            "hasNextPage": {"$gt": [total, page.saturating_mul(per_page)]},
            "hasPrevPage": {"$gt": [page, 1]}
        })),
        Stage::Project(json!({
            "data": 1,
            "metaData": {
                "totalDocs": "$totalDocs",
                "totalPages": "$totalPages",
                "hasNextPage": "$hasNextPage",
                "hasPrevPage": "$hasPrevPage",
                "page": {"$literal": page},
                "perPage": {"$literal": per_page}
            }
        })),
    ]
}
