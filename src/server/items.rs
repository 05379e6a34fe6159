//! In-memory item resource served by the demo router

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateItem {
    #[garde(length(min = 1, max = 256))]
    pub name: String,
}

/// Shared item storage keyed by id
#[derive(Debug, Clone, Default)]
pub struct ItemStore {
    items: Arc<RwLock<HashMap<u64, Item>>>,
    next_id: Arc<AtomicU64>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, name: String) -> Item {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let item = Item { id, name };
        self.items.write().await.insert(id, item.clone());
        item
    }

    pub async fn get(&self, id: u64) -> Option<Item> {
        self.items.read().await.get(&id).cloned()
    }
}

/// POST /items
pub async fn create_item(
    State(store): State<ItemStore>,
    Json(input): Json<CreateItem>,
) -> Result<(StatusCode, Json<Item>), AppError> {
    input
        .validate()
        .map_err(|report| AppError::InvalidInput(report.to_string()))?;

    let item = store.insert(input.name).await;
    info!(item_id = item.id, "Item created");

    Ok((StatusCode::CREATED, Json(item)))
}

/// GET /items/{id}
pub async fn get_item(
    State(store): State<ItemStore>,
    Path(id): Path<u64>,
) -> Result<Json<Item>, AppError> {
    store
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("item {}", id)))
}
