//! Order command and query endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{
    Aggregate, CancelOrder, ChangeDeliveryAddress, CommandResult, CompleteDelivery, CreateOrder, Money,
    Order, OrderService, PayOrder, ShopItem, StartDelivery, SubmitOrder, UpdateOrder,
};
use event_store::EventStore;
use projections::{OrderDocument, OrderQueries, OrderReadStore};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub order_service: OrderService<Arc<dyn EventStore>>,
    pub order_queries: OrderQueries<Arc<dyn OrderReadStore>>,
}

impl AppState {
    pub fn new(events: Arc<dyn EventStore>, read_model: Arc<dyn OrderReadStore>) -> Self {
        Self {
            order_service: OrderService::new(events),
            order_queries: OrderQueries::new(read_model),
        }
    }
}

type SharedState = State<Arc<AppState>>;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct ShopItemRequest {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub quantity: u64,
    pub price_cents: i64,
}

impl From<ShopItemRequest> for ShopItem {
    fn from(req: ShopItemRequest) -> Self {
        ShopItem::new(
            req.id,
            req.title,
            req.description,
            req.quantity,
            Money::from_cents(req.price_cents),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    /// Client-chosen id, so retried requests hit `AlreadyExists`.
    pub order_id: Option<AggregateId>,
    pub shop_items: Vec<ShopItemRequest>,
    pub account_email: String,
    pub delivery_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemsRequest {
    pub shop_items: Vec<ShopItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct DeliveryAddressRequest {
    pub delivery_address: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub cancel_reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteDeliveryParams {
    pub delivered_at: Option<DateTime<Utc>>,
}

// -- Response types --

/// Write-side outcome of a command.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub order_id: String,
    pub version: i64,
    pub status: String,
    pub total_price_cents: i64,
}

impl From<CommandResult<Order>> for CommandResponse {
    fn from(result: CommandResult<Order>) -> Self {
        let order = result.aggregate;
        Self {
            order_id: order.id().map(|id| id.to_string()).unwrap_or_default(),
            version: result.new_version.as_i64(),
            status: order.status().to_string(),
            total_price_cents: order.total_price().cents(),
        }
    }
}

/// Response type for event envelope data.
#[derive(Debug, Serialize)]
pub struct EventEnvelopeResponse {
    pub event_id: String,
    pub event_type: String,
    pub stream_id: String,
    pub version: i64,
    pub timestamp: String,
    pub schema_version: u32,
    pub payload: serde_json::Value,
}

// -- Handlers --

/// POST /orders: create a new order.
#[tracing::instrument(skip(state, req))]
pub async fn create(
    State(state): SharedState,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let order_id = req.order_id.unwrap_or_default();
    let cmd = CreateOrder {
        order_id,
        shop_items: req.shop_items.into_iter().map(ShopItem::from).collect(),
        account_email: req.account_email,
        delivery_address: req.delivery_address,
    };

    let result = state.order_service.create_order(cmd).await?;
    Ok((StatusCode::CREATED, Json(result.into())))
}

/// POST /orders/{id}/pay
#[tracing::instrument(skip(state))]
pub async fn pay(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let result = state.order_service.pay_order(PayOrder::new(order_id)).await?;
    Ok(Json(result.into()))
}

/// POST /orders/{id}/submit
#[tracing::instrument(skip(state))]
pub async fn submit(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let result = state
        .order_service
        .submit_order(SubmitOrder::new(order_id))
        .await?;
    Ok(Json(result.into()))
}

/// POST /orders/{id}/deliver: hand the order to delivery.
#[tracing::instrument(skip(state))]
pub async fn start_delivery(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let result = state
        .order_service
        .start_delivery(StartDelivery::new(order_id))
        .await?;
    Ok(Json(result.into()))
}

/// POST /orders/{id}/complete[?delivered_at=...]
#[tracing::instrument(skip(state))]
pub async fn complete_delivery(
    State(state): SharedState,
    Path(id): Path<String>,
    Query(params): Query<CompleteDeliveryParams>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let cmd = CompleteDelivery {
        order_id,
        delivery_timestamp: params.delivered_at,
    };
    let result = state.order_service.complete_delivery(cmd).await?;
    Ok(Json(result.into()))
}

/// POST /orders/{id}/cancel
#[tracing::instrument(skip(state, req))]
pub async fn cancel(
    State(state): SharedState,
    Path(id): Path<String>,
    Json(req): Json<CancelOrderRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let result = state
        .order_service
        .cancel_order(CancelOrder::new(order_id, req.cancel_reason))
        .await?;
    Ok(Json(result.into()))
}

/// PUT /orders/{id}/items: replace the shop items.
#[tracing::instrument(skip(state, req))]
pub async fn update_items(
    State(state): SharedState,
    Path(id): Path<String>,
    Json(req): Json<UpdateItemsRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let shop_items = req.shop_items.into_iter().map(ShopItem::from).collect();
    let result = state
        .order_service
        .update_order(UpdateOrder::new(order_id, shop_items))
        .await?;
    Ok(Json(result.into()))
}

/// PUT /orders/{id}/delivery-address
#[tracing::instrument(skip(state, req))]
pub async fn change_delivery_address(
    State(state): SharedState,
    Path(id): Path<String>,
    Json(req): Json<DeliveryAddressRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let result = state
        .order_service
        .change_delivery_address(ChangeDeliveryAddress::new(order_id, req.delivery_address))
        .await?;
    Ok(Json(result.into()))
}

/// GET /orders/{id}: the projected order document.
///
/// Served from the read model, so it may trail recent commands.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<OrderDocument>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let document = state.order_queries.get_by_id(order_id).await?;
    Ok(Json(document))
}

/// GET /orders/{id}/events: the raw event history of an order.
#[tracing::instrument(skip(state))]
pub async fn events(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventEnvelopeResponse>>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let envelopes = state.order_service.history(order_id).await?;

    let responses = envelopes
        .into_iter()
        .map(|e| -> Result<EventEnvelopeResponse, ApiError> {
            let payload = serde_json::from_slice(&e.payload)
                .map_err(|err| ApiError::Internal(format!("undecodable payload: {err}")))?;
            Ok(EventEnvelopeResponse {
                event_id: e.event_id.to_string(),
                event_type: e.event_type,
                stream_id: e.stream_id.to_string(),
                version: e.version.as_i64(),
                timestamp: e.timestamp.to_rfc3339(),
                schema_version: e.schema_version,
                payload,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(responses))
}

fn parse_aggregate_id(id: &str) -> Result<AggregateId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}
