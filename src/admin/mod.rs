//! Admin API: runtime mutation of the endpoint catalog.
//!
//! Mutations travel as [`AdminMessage`]s to the reload supervisor, which is
//! the single writer of the working configuration; each message carries a
//! oneshot reply so handlers can map the outcome to a status code without
//! racing other mutations. Reads go against a shared snapshot the supervisor
//! refreshes after every applied change.
//!
//! Wire format: `{"source": "<group>", "definition": {<endpoint>}}`.
//! `POST /apis` adds (201), `PUT /apis` updates (200), `DELETE /apis`
//! removes (204); `POST /sources` / `DELETE /sources` manage groups;
//! `POST /apply` persists pending changes to the repository (200).
use std::sync::{Arc, RwLock};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::{models::EndpointConfig, validation::ValidationError},
    ports::repository::{Configuration, RepositoryError},
};

/// Operations the admin API can request from the supervisor.
#[derive(Debug)]
pub enum ChangeMessage {
    Added {
        source: String,
        definition: EndpointConfig,
    },
    Updated {
        source: String,
        definition: EndpointConfig,
    },
    Removed {
        source: String,
        definition_name: String,
    },
    AddedSource {
        source: String,
    },
    RemovedSource {
        source: String,
    },
    ApplySources,
}

/// A change request paired with its reply channel.
#[derive(Debug)]
pub struct AdminMessage {
    pub change: ChangeMessage,
    pub reply: oneshot::Sender<Result<(), RepositoryError>>,
}

/// JSON body of `/apis` mutations.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigModel {
    pub source: String,
    #[serde(default)]
    pub definition: Option<EndpointConfig>,
}

/// Body of `/sources` mutations.
#[derive(Debug, Serialize, Deserialize)]
pub struct SourceModel {
    pub source: String,
}

#[derive(Clone)]
pub struct AdminState {
    tx: mpsc::Sender<AdminMessage>,
    view: Arc<RwLock<Configuration>>,
}

impl AdminState {
    pub fn new(tx: mpsc::Sender<AdminMessage>, view: Arc<RwLock<Configuration>>) -> Self {
        Self { tx, view }
    }

    async fn submit(&self, change: ChangeMessage) -> Result<(), RepositoryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = AdminMessage {
            change,
            reply: reply_tx,
        };
        if self.tx.send(message).await.is_err() {
            return Err(RepositoryError::Io(std::io::Error::other(
                "reload supervisor is not running",
            )));
        }
        reply_rx.await.unwrap_or_else(|_| {
            Err(RepositoryError::Io(std::io::Error::other(
                "reload supervisor dropped the request",
            )))
        })
    }
}

/// Build the admin router.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route(
            "/apis",
            get(list_apis)
                .post(add_api)
                .put(update_api)
                .delete(remove_api),
        )
        .route("/apis/{group}", get(get_group))
        .route("/sources", post(add_source).delete(remove_source))
        .route("/apply", post(apply_sources))
        .layer(axum::middleware::from_fn(
            crate::adapters::middleware::request_id_middleware,
        ))
        .layer(axum::middleware::from_fn(
            crate::adapters::middleware::request_timing_middleware,
        ))
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

async fn list_apis(State(state): State<AdminState>) -> Response {
    let view = state.view.read().expect("configuration view lock");
    Json(&view.definition_maps).into_response()
}

async fn get_group(State(state): State<AdminState>, Path(group): Path<String>) -> Response {
    let view = state.view.read().expect("configuration view lock");
    match view.group(&group) {
        Some(dm) => Json(dm).into_response(),
        None => status_error(StatusCode::NOT_FOUND, "source not found"),
    }
}

async fn add_api(State(state): State<AdminState>, Json(model): Json<ConfigModel>) -> Response {
    let Some(definition) = model.definition else {
        return status_error(StatusCode::BAD_REQUEST, "definition is required");
    };
    let result = state
        .submit(ChangeMessage::Added {
            source: model.source,
            definition,
        })
        .await;
    respond(result, StatusCode::CREATED)
}

async fn update_api(State(state): State<AdminState>, Json(model): Json<ConfigModel>) -> Response {
    let Some(definition) = model.definition else {
        return status_error(StatusCode::BAD_REQUEST, "definition is required");
    };
    let result = state
        .submit(ChangeMessage::Updated {
            source: model.source,
            definition,
        })
        .await;
    respond(result, StatusCode::OK)
}

async fn remove_api(State(state): State<AdminState>, Json(model): Json<ConfigModel>) -> Response {
    let Some(definition) = model.definition else {
        return status_error(StatusCode::BAD_REQUEST, "definition is required");
    };
    let result = state
        .submit(ChangeMessage::Removed {
            source: model.source,
            definition_name: definition.name,
        })
        .await;
    respond(result, StatusCode::NO_CONTENT)
}

async fn add_source(State(state): State<AdminState>, Json(model): Json<SourceModel>) -> Response {
    let result = state
        .submit(ChangeMessage::AddedSource {
            source: model.source,
        })
        .await;
    respond(result, StatusCode::CREATED)
}

async fn remove_source(
    State(state): State<AdminState>,
    Json(model): Json<SourceModel>,
) -> Response {
    let result = state
        .submit(ChangeMessage::RemovedSource {
            source: model.source,
        })
        .await;
    respond(result, StatusCode::NO_CONTENT)
}

async fn apply_sources(State(state): State<AdminState>) -> Response {
    respond(state.submit(ChangeMessage::ApplySources).await, StatusCode::OK)
}

fn respond(result: Result<(), RepositoryError>, success: StatusCode) -> Response {
    match result {
        Ok(()) => success.into_response(),
        Err(e) => {
            let status = match &e {
                RepositoryError::GroupNotFound(_) | RepositoryError::DefinitionNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                RepositoryError::GroupExists(_) => StatusCode::CONFLICT,
                RepositoryError::Validation(ValidationError::Conflict { .. }) => {
                    StatusCode::CONFLICT
                }
                RepositoryError::Validation(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            status_error(status, &e.to_string())
        }
    }
}

fn status_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}
