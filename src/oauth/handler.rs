//! Device-code flow orchestration
//!
//! `auth_start` registers a client, begins device authorization, stores a
//! pending session and spawns the background poll task that turns a
//! completed login into a pool account.

use std::time::Duration;

use crate::dispatch::AppState;
use crate::store::auth_sessions::{AuthFlowKind, AuthSession, AuthSessionStatus};
use crate::store::db::now_epoch;

use super::sso_oidc::{CreateTokenResult, SsoOidcClient};
use super::types::{AuthStartBody, AuthStartResponse, AuthStatusResponse};

/// Polling never outlives this, whatever the device grant allows
const MAX_POLL_SECS: u64 = 300;

pub fn parse_flow_kind(flow_type: &str) -> Option<AuthFlowKind> {
    match flow_type {
        "amazonq_builder_id" => Some(AuthFlowKind::AmazonqBuilderId),
        "kiro_builder_id" => Some(AuthFlowKind::KiroBuilderId),
        _ => None,
    }
}

fn status_str(status: &AuthSessionStatus) -> &'static str {
    match status {
        AuthSessionStatus::Pending => "pending",
        AuthSessionStatus::Completed => "completed",
        AuthSessionStatus::Timeout => "timeout",
        AuthSessionStatus::Error => "error",
    }
}

/// Begin a device-code login.
pub async fn auth_start(
    state: &AppState,
    body: &AuthStartBody,
) -> Result<AuthStartResponse, String> {
    let kind = parse_flow_kind(&body.flow_type)
        .ok_or_else(|| format!("unknown auth flow type: {}", body.flow_type))?;

    let region = body
        .region
        .clone()
        .unwrap_or_else(|| state.config.kiro_default_region.clone());
    let oidc = SsoOidcClient::new(state.client.clone(), &region);

    let client_name = match kind {
        AuthFlowKind::AmazonqBuilderId => "Amazon Q Developer",
        AuthFlowKind::KiroBuilderId => "Kiro IDE",
    };
    let registration = oidc
        .register_client(client_name)
        .await
        .map_err(|e| format!("Authentication service error: {}", e))?;
    let device = oidc
        .start_device_authorization(&registration.client_id, &registration.client_secret)
        .await
        .map_err(|e| format!("Authentication service error: {}", e))?;

    let auth_id = uuid::Uuid::new_v4().to_string();
    let session = AuthSession {
        auth_id: auth_id.clone(),
        kind,
        client_id: registration.client_id,
        client_secret: registration.client_secret,
        device_code: device.device_code,
        user_code: Some(device.user_code),
        verification_uri_complete: device
            .verification_uri_complete
            .or(device.verification_uri),
        interval: device.interval.max(1),
        expires_in: device.expires_in,
        start_time: now_epoch(),
        label: body.label.clone(),
        enabled: body.enabled.unwrap_or(true),
        status: AuthSessionStatus::Pending,
        error: None,
        account_id: None,
    };
    state
        .auth_sessions
        .save(&session)
        .await
        .map_err(|e| format!("Failed to persist auth session: {}", e))?;

    let response = AuthStartResponse {
        auth_id: auth_id.clone(),
        verification_uri_complete: session.verification_uri_complete.clone(),
        user_code: session.user_code.clone(),
        expires_in: session.expires_in,
        interval: session.interval,
    };

    let poll_state = state.clone();
    tokio::spawn(async move {
        poll_device_flow(poll_state, auth_id, region).await;
    });

    Ok(response)
}

/// Background poll: drives the device grant to a terminal state and creates
/// the account on success.
async fn poll_device_flow(state: AppState, auth_id: String, region: String) {
    let Ok(Some(mut session)) = state.auth_sessions.load(&auth_id).await else {
        return;
    };
    if session.status != AuthSessionStatus::Pending {
        return;
    }

    let oidc = SsoOidcClient::new(state.client.clone(), &region);
    let deadline = session.start_time + session.expires_in.min(MAX_POLL_SECS) as i64;
    let mut interval = session.interval.max(1);

    let outcome = loop {
        if now_epoch() >= deadline {
            break Err(AuthSessionStatus::Timeout);
        }
        tokio::time::sleep(Duration::from_secs(interval)).await;

        match oidc
            .create_token(&session.client_id, &session.client_secret, &session.device_code)
            .await
        {
            Ok(CreateTokenResult::Pending) => {}
            Ok(CreateTokenResult::SlowDown) => interval += 5,
            Ok(CreateTokenResult::Expired) => break Err(AuthSessionStatus::Timeout),
            Ok(CreateTokenResult::Success(tokens)) => break Ok(tokens),
            Err(e) => {
                tracing::error!("Device flow poll failed for {}: {}", auth_id, e);
                session.error = Some("Authentication failed".to_string());
                break Err(AuthSessionStatus::Error);
            }
        }
    };

    match outcome {
        Ok(tokens) => {
            let Some(refresh_token) = tokens.refresh_token.as_deref() else {
                session.status = AuthSessionStatus::Error;
                session.error = Some("No refresh token returned from OIDC".to_string());
                let _ = state.auth_sessions.save(&session).await;
                return;
            };

            let created = match session.kind {
                AuthFlowKind::KiroBuilderId => {
                    state
                        .accounts
                        .create_kiro_builder_id_account_from_tokens(
                            &session.client_id,
                            &session.client_secret,
                            &tokens.access_token,
                            refresh_token,
                            session.label.as_deref(),
                            session.enabled,
                            Some(&region),
                            tokens.expires_in,
                        )
                        .await
                }
                AuthFlowKind::AmazonqBuilderId => {
                    state
                        .accounts
                        .create_account_from_tokens(
                            &session.client_id,
                            &session.client_secret,
                            &tokens.access_token,
                            Some(refresh_token),
                            session.label.as_deref(),
                            session.enabled,
                            tokens.expires_in,
                        )
                        .await
                }
            };

            match created {
                Ok(account) => {
                    tracing::info!("Device flow {} created account {}", auth_id, account.id);
                    session.status = AuthSessionStatus::Completed;
                    session.account_id = Some(account.id);
                    session.error = None;
                }
                Err(e) => {
                    tracing::error!("Device flow {} account creation failed: {}", auth_id, e);
                    session.status = AuthSessionStatus::Error;
                    session.error = Some(e.to_string());
                }
            }
        }
        Err(terminal) => session.status = terminal,
    }

    if let Err(e) = state.auth_sessions.save(&session).await {
        tracing::error!("Failed to persist terminal auth session {}: {}", auth_id, e);
    }
}

/// Current status of a flow.
pub async fn auth_status(state: &AppState, auth_id: &str) -> Option<AuthStatusResponse> {
    let session = state.auth_sessions.load(auth_id).await.ok()??;
    let deadline = session.start_time + session.expires_in.min(MAX_POLL_SECS) as i64;
    Some(AuthStatusResponse {
        status: status_str(&session.status).to_string(),
        remaining: (deadline - now_epoch()).max(0),
        error: session.error.clone(),
        account_id: session.account_id.clone(),
    })
}

/// Claim the created account once the flow completed.
pub async fn auth_claim(state: &AppState, auth_id: &str) -> Result<Option<String>, String> {
    let session = state
        .auth_sessions
        .load(auth_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "Auth session not found".to_string())?;

    if session.status == AuthSessionStatus::Completed {
        Ok(session.account_id)
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_kind_parsing() {
        assert_eq!(
            parse_flow_kind("kiro_builder_id"),
            Some(AuthFlowKind::KiroBuilderId)
        );
        assert_eq!(
            parse_flow_kind("amazonq_builder_id"),
            Some(AuthFlowKind::AmazonqBuilderId)
        );
        assert!(parse_flow_kind("github").is_none());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(status_str(&AuthSessionStatus::Pending), "pending");
        assert_eq!(status_str(&AuthSessionStatus::Completed), "completed");
        assert_eq!(status_str(&AuthSessionStatus::Timeout), "timeout");
        assert_eq!(status_str(&AuthSessionStatus::Error), "error");
    }
}
