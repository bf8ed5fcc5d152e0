use axum::Json;

use crate::response::ApiResponse;

pub async fn health_check() -> Json<ApiResponse<()>> {
    Json(ApiResponse::message("ok"))
}
