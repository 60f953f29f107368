//! CRUD endpoints. Every successful mutation goes through [`ChatService`],
//! which publishes the event the live channel fans out.
//!
//! Callers identify themselves with `x-username` and `x-api-key` headers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parley_core::model::{ChatMessage, Chatroom, User};
use parley_core::security::Credential;
use parley_store::{KeyedUser, ServiceError};
use serde::{Deserialize, Serialize};

use crate::server::AppState;

pub const USERNAME_HEADER: &str = "x-username";
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// JSON error with a status matching its code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Invalid(field) => {
                Self::new(StatusCode::BAD_REQUEST, "validation_error", format!("invalid {field}"))
            }
            ServiceError::Unauthorized => {
                Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid credentials")
            }
            ServiceError::NotFound(what) => Self::new(StatusCode::NOT_FOUND, "not_found", what),
            ServiceError::Forbidden(what) => Self::new(StatusCode::FORBIDDEN, "forbidden", what),
            ServiceError::Conflict(what) => {
                tracing::debug!(%what, "conflicting mutation");
                Self::new(StatusCode::CONFLICT, "conflict", "conflicts with existing data")
            }
            ServiceError::Store(err) => {
                tracing::error!(error = %err, "store failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "storage failure")
            }
        }
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text()))
}

/// The authenticated caller of a request.
pub struct Caller(pub User);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let (Some(username), Some(api_key)) = (header(USERNAME_HEADER), header(API_KEY_HEADER)) else {
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing credentials",
            ));
        };
        let user = state
            .service
            .authenticate(&username, &Credential::new(api_key))
            .await?;
        Ok(Self(user))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user).put(update_user))
        .route("/users/{username}", get(get_user).delete(delete_user))
        .route("/chatrooms", get(list_chatrooms).post(create_chatroom))
        .route("/chatrooms/owner/{username}", get(list_chatrooms_by_owner))
        .route("/chatrooms/{id}", delete(delete_chatroom))
        .route("/messages", post(post_message))
        .route("/messages/chatroom/{id}", get(list_messages_by_chatroom))
        .route("/messages/user/{username}", get(list_messages_by_user))
        .route("/messages/{id}", get(get_message).delete(delete_message))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: Credential,
    #[serde(default)]
    pub description: String,
}

/// Returned by signup and update: the account plus its current key.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserKeyResponse {
    pub username: String,
    pub api_key: String,
    pub description: String,
}

impl From<KeyedUser> for UserKeyResponse {
    fn from(keyed: KeyedUser) -> Self {
        Self {
            username: keyed.user.username,
            api_key: keyed.api_key,
            description: keyed.user.description,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub username: String,
    #[serde(default)]
    pub password: Option<Credential>,
    #[serde(default)]
    pub description: Option<String>,
}

async fn create_user(
    State(state): State<AppState>,
    body: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(body)?;
    let created = state
        .service
        .create_user(&req.username, &req.password, &req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(UserKeyResponse::from(created))))
}

async fn update_user(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<UserKeyResponse>, ApiError> {
    let req = json_body(body)?;
    let updated = state
        .service
        .update_user(
            &caller,
            &req.username,
            req.password.as_ref(),
            req.description.as_deref(),
        )
        .await?;
    Ok(Json(updated.into()))
}

async fn list_users(
    State(state): State<AppState>,
    _caller: Caller,
) -> Result<Json<Vec<User>>, ApiError> {
    Ok(Json(state.service.list_users().await?))
}

async fn get_user(
    State(state): State<AppState>,
    _caller: Caller,
    Path(username): Path<String>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.service.get_user(&username).await?))
}

async fn delete_user(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_user(&caller, &username).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_chatrooms(
    State(state): State<AppState>,
    _caller: Caller,
) -> Result<Json<Vec<Chatroom>>, ApiError> {
    Ok(Json(state.service.list_chatrooms().await?))
}

async fn list_chatrooms_by_owner(
    State(state): State<AppState>,
    _caller: Caller,
    Path(username): Path<String>,
) -> Result<Json<Vec<Chatroom>>, ApiError> {
    Ok(Json(state.service.list_chatrooms_by_owner(&username).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateChatroomRequest {
    pub topic: String,
}

async fn create_chatroom(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Result<Json<CreateChatroomRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(body)?;
    let chatroom = state.service.create_chatroom(&caller, &req.topic).await?;
    Ok((StatusCode::CREATED, Json(chatroom)))
}

async fn delete_chatroom(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_chatroom(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages_by_chatroom(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.service.list_messages_by_chatroom(&id).await?))
}

async fn list_messages_by_user(
    State(state): State<AppState>,
    _caller: Caller,
    Path(username): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.service.list_messages_by_user(&username).await?))
}

async fn get_message(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<ChatMessage>, ApiError> {
    Ok(Json(state.service.get_message(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub chatroom_id: String,
    pub content: String,
}

async fn post_message(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Result<Json<PostMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(body)?;
    let message = state
        .service
        .post_message(&caller, &req.chatroom_id, &req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn delete_message(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_message(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
