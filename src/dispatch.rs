// Transaction Ingestor and Query Dispatch
// The homeserver-facing handlers: authenticated transaction ingestion with
// dedup, demux into room/ephemeral/key-material streams, and the user,
// room, third-party and key query surface

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::events::{AppserviceEvent, MembershipState, RoomEvent, Transaction};
use crate::namespace::NamespaceMatcher;
use crate::preprocessor::EventKind;
use crate::Appservice;
use crate::RoomTracker;

pub(crate) fn error_response(status: StatusCode, errcode: &str, error: &str) -> Response {
    (status, Json(json!({"errcode": errcode, "error": error}))).into_response()
}

fn ok_empty() -> Response {
    (StatusCode::OK, Json(json!({}))).into_response()
}

fn not_found(errcode: &str, error: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, errcode, error)
}

fn internal_error() -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN", "Internal error")
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Every request must present the hs_token, either as a Bearer header or as
/// the legacy `access_token` query parameter.
pub(crate) async fn authenticate(
    State(appservice): State<Appservice>,
    request: Request,
    next: Next,
) -> Response {
    let presented = bearer_token(request.headers())
        .or_else(|| query_param(request.uri(), "access_token"));

    match presented {
        Some(token) if token == appservice.registration().hs_token => next.run(request).await,
        _ => error_response(
            StatusCode::UNAUTHORIZED,
            "AUTH_FAILED",
            "Authentication failed",
        ),
    }
}

pub(crate) async fn unknown_endpoint() -> Response {
    not_found("M_UNRECOGNIZED", "Endpoint not implemented")
}

/// PUT /transactions/{txnId}
pub(crate) async fn handle_transaction(
    State(appservice): State<Appservice>,
    Path(txn_id): Path<String>,
    body: Bytes,
) -> Response {
    let invalid_body = || {
        error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "Invalid JSON: expected events",
        )
    };

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(_) => return invalid_body(),
    };
    if !raw.is_object() || !raw.get("events").map_or(false, Value::is_array) {
        return invalid_body();
    }
    let transaction: Transaction = match serde_json::from_value(raw) {
        Ok(transaction) => transaction,
        Err(_) => return invalid_body(),
    };

    // Re-entrant deliveries of the same id are serialized; the second one
    // observes the first as complete and becomes a no-op.
    let guard = appservice.dedup().acquire(&txn_id).await;
    if appservice.dedup().contains(&txn_id).await {
        tracing::debug!("Transaction {} already processed", txn_id);
        drop(guard);
        appservice.dedup().release(&txn_id).await;
        return ok_empty();
    }

    process_transaction(&appservice, &txn_id, transaction).await;

    appservice.dedup().mark(&txn_id).await;
    drop(guard);
    appservice.dedup().release(&txn_id).await;
    ok_empty()
}

async fn process_transaction(appservice: &Appservice, txn_id: &str, transaction: Transaction) {
    let Transaction {
        events,
        ephemeral,
        device_lists,
        one_time_keys_count,
        unused_fallback_keys,
    } = transaction;

    tracing::debug!("Processing transaction {} with {} events", txn_id, events.len());

    for raw in events {
        let mut event = match RoomEvent::from_value(raw) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!("Skipping malformed event in {}: {}", txn_id, error);
                continue;
            }
        };

        if let Err(error) = appservice
            .run_preprocessors(&mut event, EventKind::RoomEvent)
            .await
        {
            tracing::warn!("Preprocessor dropped event in {}: {}", txn_id, error);
            continue;
        }

        dispatch_room_event(appservice, event).await;
    }

    for raw in ephemeral.unwrap_or_default() {
        let mut event = match RoomEvent::from_value(raw) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!("Skipping malformed ephemeral event in {}: {}", txn_id, error);
                continue;
            }
        };

        if let Err(error) = appservice
            .run_preprocessors(&mut event, EventKind::EphemeralEvent)
            .await
        {
            tracing::warn!(
                "Preprocessor dropped ephemeral event in {}: {}",
                txn_id,
                error
            );
            continue;
        }

        appservice.emit(AppserviceEvent::EphemeralEvent { event });
    }

    route_key_material(
        appservice,
        device_lists,
        one_time_keys_count,
        unused_fallback_keys,
    )
    .await;
}

async fn route_key_material(
    appservice: &Appservice,
    device_lists: Option<crate::events::DeviceLists>,
    one_time_keys_count: Option<crate::events::OneTimeKeyCounts>,
    unused_fallback_keys: Option<crate::events::FallbackKeyTypes>,
) {
    if let Some(crypto) = appservice.crypto() {
        if let Err(error) = crypto
            .update_sync_data(
                device_lists.as_ref(),
                one_time_keys_count.as_ref(),
                unused_fallback_keys.as_ref(),
            )
            .await
        {
            tracing::warn!("Crypto engine rejected key material: {}", error);
        }
    }

    if let Some(device_lists) = device_lists {
        if !device_lists.is_empty() {
            appservice.emit(AppserviceEvent::DeviceLists(device_lists));
        }
    }
    if let Some(counts) = one_time_keys_count {
        appservice.emit(AppserviceEvent::OneTimeKeyCounts(counts));
    }
    if let Some(fallback) = unused_fallback_keys {
        appservice.emit(AppserviceEvent::UnusedFallbackKeys(fallback));
    }
}

async fn dispatch_room_event(appservice: &Appservice, event: RoomEvent) {
    let room_id = event.room_id.clone().unwrap_or_default();

    appservice.emit(AppserviceEvent::RoomEvent {
        room_id: room_id.clone(),
        event: event.clone(),
    });

    match event.event_type.as_str() {
        "m.room.message" => {
            appservice.emit(AppserviceEvent::RoomMessage {
                room_id,
                event,
            });
        }
        "m.room.encrypted" => {
            appservice.emit(AppserviceEvent::RoomEncrypted {
                room_id: room_id.clone(),
                event: event.clone(),
            });
            if let Some(crypto) = appservice.crypto() {
                match crypto.decrypt_event(&room_id, &event).await {
                    Ok(plaintext) => appservice.emit(AppserviceEvent::RoomDecrypted {
                        room_id,
                        event: plaintext,
                    }),
                    Err(error) => appservice.emit(AppserviceEvent::RoomFailedDecryption {
                        room_id,
                        event,
                        error: error.to_string(),
                    }),
                }
            }
        }
        "m.room.member" => {
            route_membership(appservice, room_id, event).await;
        }
        "m.room.tombstone" => {
            appservice.emit(AppserviceEvent::RoomArchived { room_id, event });
        }
        "m.room.create" => {
            // Any create carrying a predecessor counts, current or historical.
            if event.has_predecessor() {
                appservice.emit(AppserviceEvent::RoomUpgraded { room_id, event });
            }
        }
        "m.room.encryption" => {
            if event.state_key.as_deref() == Some("") {
                if let Some(tracker) = appservice.room_tracker() {
                    RoomTracker::queue_refresh(&tracker, &room_id).await;
                }
            }
        }
        _ => {}
    }
}

async fn route_membership(appservice: &Appservice, room_id: String, event: RoomEvent) {
    let state_key = match event.state_key.as_deref() {
        Some(state_key) if !state_key.is_empty() => state_key.to_string(),
        _ => return,
    };
    if !appservice.namespaces().is_namespaced_user(&state_key) {
        return;
    }

    let intent = appservice.intents().get_intent(&state_key).await;
    match event.membership() {
        Some(MembershipState::Join) => {
            intent.note_joined(&room_id).await;
            if let Some(tracker) = appservice.room_tracker() {
                RoomTracker::queue_refresh(&tracker, &room_id).await;
            }
            appservice.emit(AppserviceEvent::RoomJoin { room_id, event });
        }
        // Bans route as leaves.
        Some(MembershipState::Leave) | Some(MembershipState::Ban) => {
            intent.note_left(&room_id).await;
            appservice.emit(AppserviceEvent::RoomLeave { room_id, event });
        }
        Some(MembershipState::Invite) => {
            appservice.emit(AppserviceEvent::RoomInvite { room_id, event });
        }
        _ => {}
    }
}

/// GET /users/{userId}
pub(crate) async fn handle_user_query(
    State(appservice): State<Appservice>,
    Path(user_id): Path<String>,
) -> Response {
    let answer = appservice
        .query(|responder| AppserviceEvent::QueryUser {
            user_id: user_id.clone(),
            responder,
        })
        .await
        .flatten();

    let profile = match answer {
        Some(profile) => profile,
        None => return not_found("USER_DOES_NOT_EXIST", "User not created"),
    };

    let intent = appservice.intents().get_intent(&user_id).await;
    if let Err(error) = intent.ensure_registered().await {
        tracing::warn!("Provisioning queried user {} failed: {}", user_id, error);
        return internal_error();
    }
    if let Some(display_name) = &profile.display_name {
        if let Err(error) = intent.client().set_display_name(display_name).await {
            tracing::warn!("Setting display name for {} failed: {}", user_id, error);
            return internal_error();
        }
    }
    if let Some(avatar_mxc) = &profile.avatar_mxc {
        if let Err(error) = intent.client().set_avatar_url(avatar_mxc).await {
            tracing::warn!("Setting avatar for {} failed: {}", user_id, error);
            return internal_error();
        }
    }
    ok_empty()
}

/// GET /rooms/{roomAlias}
pub(crate) async fn handle_room_query(
    State(appservice): State<Appservice>,
    Path(room_alias): Path<String>,
) -> Response {
    let answer = appservice
        .query(|responder| AppserviceEvent::QueryRoom {
            alias: room_alias.clone(),
            responder,
        })
        .await
        .flatten();

    let mut options = match answer {
        Some(options) => options,
        None => return not_found("ROOM_DOES_NOT_EXIST", "Room not created"),
    };

    let localpart = NamespaceMatcher::alias_localpart(&room_alias);
    options.insert("room_alias_name".to_string(), json!(localpart));

    match appservice
        .bot_client()
        .create_room(Value::Object(options.clone()))
        .await
    {
        Ok(room_id) => {
            options.insert("__roomId".to_string(), json!(room_id));
            (StatusCode::OK, Json(Value::Object(options))).into_response()
        }
        Err(error) => {
            tracing::warn!("Creating queried room {} failed: {}", room_alias, error);
            internal_error()
        }
    }
}

/// GET /thirdparty/protocol/{protocol}
pub(crate) async fn handle_thirdparty_protocol(
    State(appservice): State<Appservice>,
    Path(protocol): Path<String>,
) -> Response {
    if !appservice.registration().handles_protocol(&protocol) {
        return not_found("PROTOCOL_NOT_HANDLED", "Protocol not handled");
    }

    let answer = appservice
        .query(|responder| AppserviceEvent::ThirdpartyProtocol {
            protocol: protocol.clone(),
            responder,
        })
        .await
        .flatten();

    match answer {
        Some(metadata) => (StatusCode::OK, Json(metadata)).into_response(),
        None => not_found("PROTOCOL_NOT_HANDLED", "Protocol not handled"),
    }
}

fn lookup_fields(params: HashMap<String, String>) -> HashMap<String, String> {
    params
        .into_iter()
        .filter(|(key, _)| key != "access_token")
        .collect()
}

fn mapping_response(results: Option<Vec<Value>>) -> Response {
    match results {
        Some(results) if !results.is_empty() => {
            (StatusCode::OK, Json(Value::Array(results))).into_response()
        }
        _ => not_found("NO_MAPPING_FOUND", "No mappings found"),
    }
}

/// GET /thirdparty/user/{protocol}
pub(crate) async fn handle_thirdparty_user_remote(
    State(appservice): State<Appservice>,
    Path(protocol): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !appservice.registration().handles_protocol(&protocol) {
        return not_found("PROTOCOL_NOT_HANDLED", "Protocol not handled");
    }
    let results = appservice
        .query(|responder| AppserviceEvent::ThirdpartyUserRemote {
            protocol: protocol.clone(),
            fields: lookup_fields(params),
            responder,
        })
        .await;
    mapping_response(results)
}

/// GET /thirdparty/user?userid=...
pub(crate) async fn handle_thirdparty_user_matrix(
    State(appservice): State<Appservice>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let user_id = match params.get("userid") {
        Some(user_id) => user_id.clone(),
        None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PARAMETERS",
                "Required parameters missing",
            )
        }
    };
    let results = appservice
        .query(|responder| AppserviceEvent::ThirdpartyUserMatrix {
            user_id,
            responder,
        })
        .await;
    mapping_response(results)
}

/// GET /thirdparty/location/{protocol}
pub(crate) async fn handle_thirdparty_location_remote(
    State(appservice): State<Appservice>,
    Path(protocol): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !appservice.registration().handles_protocol(&protocol) {
        return not_found("PROTOCOL_NOT_HANDLED", "Protocol not handled");
    }
    let results = appservice
        .query(|responder| AppserviceEvent::ThirdpartyLocationRemote {
            protocol: protocol.clone(),
            fields: lookup_fields(params),
            responder,
        })
        .await;
    mapping_response(results)
}

/// GET /thirdparty/location?alias=...
pub(crate) async fn handle_thirdparty_location_matrix(
    State(appservice): State<Appservice>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let alias = match params.get("alias") {
        Some(alias) => alias.clone(),
        None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PARAMETERS",
                "Required parameters missing",
            )
        }
    };
    let results = appservice
        .query(|responder| AppserviceEvent::ThirdpartyLocationMatrix { alias, responder })
        .await;
    mapping_response(results)
}

/// POST /unstable/org.matrix.msc3983/keys/claim
pub(crate) async fn handle_key_claim(
    State(appservice): State<Appservice>,
    Json(body): Json<Value>,
) -> Response {
    if !appservice.key_claim_enabled() {
        return not_found("M_UNRECOGNIZED", "Endpoint not implemented");
    }
    let answer = appservice
        .query(|responder| AppserviceEvent::KeyClaim { body, responder })
        .await;
    match answer {
        Some(result) => (StatusCode::OK, Json(result)).into_response(),
        None => not_found("M_UNRECOGNIZED", "Endpoint not implemented"),
    }
}

/// POST /unstable/org.matrix.msc3984/keys/query
pub(crate) async fn handle_key_query(
    State(appservice): State<Appservice>,
    Json(body): Json<Value>,
) -> Response {
    if !appservice.key_query_enabled() {
        return not_found("M_UNRECOGNIZED", "Endpoint not implemented");
    }
    let answer = appservice
        .query(|responder| AppserviceEvent::KeyQuery { body, responder })
        .await;
    match answer {
        Some(result) => (StatusCode::OK, Json(result)).into_response(),
        None => not_found("M_UNRECOGNIZED", "Endpoint not implemented"),
    }
}
