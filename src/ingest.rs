//! `POST /events`: lets call front ends publish onto the relay's bus.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::bus::{EventPublisher, PublishReceipt};
use crate::events::{EventType, Payload};

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub event_type: String,
    #[serde(default, alias = "data")]
    pub payload: Payload,
    #[serde(default)]
    pub stream_id: Option<String>,
}

pub fn ingest_routes(publisher: Arc<EventPublisher>) -> Router {
    Router::new()
        .route("/events", post(ingest))
        .with_state(publisher)
}

async fn ingest(
    State(publisher): State<Arc<EventPublisher>>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<PublishReceipt>), (StatusCode, Json<Value>)> {
    let event_type = EventType::parse(&req.event_type);
    match publisher
        .publish(event_type, req.payload, req.stream_id.as_deref())
        .await
    {
        Ok(receipt) => Ok((StatusCode::ACCEPTED, Json(receipt))),
        Err(e) => {
            warn!(error = %e, "Ingest publish failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::{InMemoryBus, MessageBus, TopicMap};

    #[tokio::test]
    async fn accepted_event_lands_on_bus() {
        let bus = Arc::new(InMemoryBus::default());
        let mut sub = bus.subscribe(&TopicMap::default().all()).await.unwrap();
        let app = ingest_routes(Arc::new(EventPublisher::new(bus.clone(), TopicMap::default())));

        let resp = app
            .oneshot(
                Request::post("/events")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"event_type":"customer_data","data":{"name":"Dana"},"stream_id":"CA1"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.topic, "customer:data:new");
        let body: Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body["payload"]["name"], "Dana");
    }

    #[tokio::test]
    async fn malformed_request_is_rejected() {
        let bus = Arc::new(InMemoryBus::default());
        let app = ingest_routes(Arc::new(EventPublisher::new(bus, TopicMap::default())));

        let resp = app
            .oneshot(
                Request::post("/events")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"payload":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }
}
