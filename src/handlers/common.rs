use crate::errors::ServiceError;
use crate::services::PageRequest;
use crate::ApiResponse;
use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// `201 Created` with the success envelope.
pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, Json(ApiResponse::success(data)))
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse::success(data))
}

/// Parses a status string with the entity's own text form; unknown values are a 400.
pub fn parse_status<T>(field: &str, raw: &str) -> Result<T, ServiceError>
where
    T: FromStr,
{
    T::from_str(raw.trim())
        .map_err(|_| ServiceError::ValidationError(format!("invalid {}: {}", field, raw)))
}

pub fn parse_optional_status<T>(field: &str, raw: Option<&str>) -> Result<Option<T>, ServiceError>
where
    T: FromStr,
{
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| parse_status(field, s))
        .transpose()
}

/// Query string of the list endpoints.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
    pub status: Option<String>,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

impl ListParams {
    pub fn page_request(&self) -> PageRequest {
        PageRequest::new(self.page, self.per_page)
    }
}

#[derive(Debug, Serialize)]
pub struct PaginationMeta {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl PaginationMeta {
    pub fn new(page: PageRequest, total: u64) -> Self {
        Self {
            page: page.page,
            per_page: page.per_page,
            total,
            total_pages: total.div_ceil(page.per_page),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub pagination: PaginationMeta,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, page: PageRequest, total: u64) -> Self {
        Self {
            items,
            pagination: PaginationMeta::new(page, total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{OrderStatus, UnitStatus};
    use assert_matches::assert_matches;

    #[test]
    fn parses_known_statuses() {
        let status: OrderStatus = parse_status("status", "in_production").unwrap();
        assert_eq!(status, OrderStatus::InProduction);
        let unit: Option<UnitStatus> = parse_optional_status("status", Some("damaged")).unwrap();
        assert_eq!(unit, Some(UnitStatus::Damaged));
        let none: Option<UnitStatus> = parse_optional_status("status", Some("  ")).unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn unknown_status_is_a_validation_error() {
        let result: Result<OrderStatus, _> = parse_status("status", "shipped");
        assert_matches!(result, Err(ServiceError::ValidationError(msg)) if msg.contains("shipped"));
    }

    #[test]
    fn pagination_meta_rounds_pages_up() {
        let meta = PaginationMeta::new(PageRequest::new(2, 20), 41);
        assert_eq!(meta.total_pages, 3);
        assert_eq!(PaginationMeta::new(PageRequest::default(), 0).total_pages, 0);
    }
}
