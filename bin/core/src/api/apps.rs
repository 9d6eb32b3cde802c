use axum::{
  Json, Router,
  extract::{Path, Query},
  routing::get,
};
use serde::Deserialize;

use crate::{catalog::catalog, entities::AppTemplate, error::ApiError};

pub fn router() -> Router {
  Router::new().route("/", get(list)).route("/{id}", get(get_one))
}

#[derive(Deserialize)]
struct ListQuery {
  category: Option<String>,
}

async fn list(Query(query): Query<ListQuery>) -> Json<Vec<AppTemplate>> {
  Json(
    catalog()
      .list(query.category.as_deref())
      .into_iter()
      .cloned()
      .collect(),
  )
}

async fn get_one(Path(id): Path<String>) -> Result<Json<AppTemplate>, ApiError> {
  catalog()
    .get(&id)
    .cloned()
    .map(Json)
    .ok_or_else(|| ApiError::NotFound("app".to_string()))
}
