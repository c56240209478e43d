use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    auth::{
        dto::{
            MessageResponse, ProfileResponse, RegisterRequest, RegisterResponse, RoleResponse,
            SendOtpRequest, UpdateProfileRequest, VerifyOtpRequest,
        },
        extractors::FirebaseUser,
        services::{is_valid_email, normalize_email},
    },
    error::{ApiError, ApiResult},
    state::AppState,
    users::{NewUser, ProfileUpdate, Role, Upsert},
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/role/:uid", get(get_role))
        .route("/auth/send-otp", post(send_otp))
        .route("/auth/verify-otp", post(verify_otp))
}

pub fn profile_routes() -> Router<AppState> {
    Router::new().route("/auth/profile", get(get_profile).put(update_profile))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[instrument(skip(state, caller, payload), fields(uid = %caller.uid))]
pub async fn register(
    State(state): State<AppState>,
    caller: FirebaseUser,
    Json(mut payload): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    if payload.uid != caller.uid {
        warn!(body_uid = %payload.uid, "uid does not match token");
        return Err(ApiError::Forbidden("UID mismatch".into()));
    }

    payload.email = normalize_email(&payload.email);
    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::BadRequest("Invalid email".into()));
    }
    if let Some(token_email) = caller.email.as_deref().map(normalize_email) {
        if token_email != payload.email {
            debug!(%token_email, "registration email differs from token email");
        }
    }

    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Name is required".into()));
    }

    let role = match payload.role.parse::<Role>() {
        Ok(Role::Admin) => {
            warn!("self-registration as admin refused");
            return Err(ApiError::BadRequest("Invalid role".into()));
        }
        Ok(role) => role,
        Err(_) => return Err(ApiError::BadRequest("Invalid role".into())),
    };

    if state.config.require_verified_email && !state.otp.is_verified(&payload.email).await? {
        warn!(email = %payload.email, "registration before email verification");
        return Err(ApiError::Forbidden("Email not verified".into()));
    }

    let new_user = NewUser {
        uid: payload.uid,
        email: payload.email,
        name: name.to_string(),
        phone: non_empty(payload.phone),
        role,
    };

    let user = match state.users.find_or_create(new_user).await? {
        Upsert::Created(user) => {
            info!(email = %user.email, role = %user.role, "user registered");
            user
        }
        Upsert::Existing(user) => {
            info!("user already registered");
            user
        }
        Upsert::EmailTaken => {
            warn!("email already registered to another account");
            return Err(ApiError::Conflict("Email already registered".into()));
        }
    };

    Ok(Json(RegisterResponse {
        success: true,
        role: user.role,
        user,
    }))
}

#[instrument(skip(state, _caller))]
pub async fn get_role(
    State(state): State<AppState>,
    _caller: FirebaseUser,
    Path(uid): Path<String>,
) -> ApiResult<Json<RoleResponse>> {
    let user = state
        .users
        .find_by_uid(&uid)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    Ok(Json(RoleResponse {
        success: true,
        role: user.role,
    }))
}

#[instrument(skip(state, payload))]
pub async fn send_otp(
    State(state): State<AppState>,
    Json(payload): Json<SendOtpRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let email = normalize_email(&payload.email);
    if email.is_empty() {
        return Err(ApiError::BadRequest("Email is required".into()));
    }
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(ApiError::BadRequest("Invalid email".into()));
    }

    state.otp.send(&email).await?;
    info!(email = %email, "otp sent");
    Ok(Json(MessageResponse::ok("OTP sent successfully")))
}

#[instrument(skip(state, payload))]
pub async fn verify_otp(
    State(state): State<AppState>,
    Json(payload): Json<VerifyOtpRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let email = normalize_email(&payload.email);
    if email.is_empty() || payload.otp.trim().is_empty() {
        return Err(ApiError::BadRequest("Email and OTP are required".into()));
    }

    state.otp.verify(&email, &payload.otp).await?;
    info!(email = %email, "email verified");
    Ok(Json(MessageResponse::ok("OTP verified successfully")))
}

#[instrument(skip(state, caller), fields(uid = %caller.uid))]
pub async fn get_profile(
    State(state): State<AppState>,
    caller: FirebaseUser,
) -> ApiResult<Json<ProfileResponse>> {
    let user = state
        .users
        .find_by_uid(&caller.uid)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    Ok(Json(ProfileResponse {
        success: true,
        user,
    }))
}

#[instrument(skip(state, caller, payload), fields(uid = %caller.uid))]
pub async fn update_profile(
    State(state): State<AppState>,
    caller: FirebaseUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> ApiResult<Json<ProfileResponse>> {
    let name = match payload.name {
        Some(name) if name.trim().is_empty() => {
            return Err(ApiError::BadRequest("Name cannot be empty".into()));
        }
        other => non_empty(other),
    };
    let update = ProfileUpdate {
        name,
        phone: payload.phone.map(|p| non_empty(Some(p))),
    };

    let user = state
        .users
        .update_profile(&caller.uid, update)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    info!("profile updated");
    Ok(Json(ProfileResponse {
        success: true,
        user,
    }))
}
