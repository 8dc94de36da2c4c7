//! JSON control API
//!
//! Read endpoints list paths and per-protocol sessions with stable paging;
//! write endpoints mutate the configuration store. A config mutation is a
//! deep JSON merge onto the current document followed by full validation,
//! so a bad patch is rejected as a whole and the running generation stays
//! untouched.

pub mod defs;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post};
use axum::Router;
use serde_json::Value;

use crate::conf::{Conf, ConfStore, OptionalPathConf};
use crate::error::RelayError;
use crate::path::manager::PathManager;
use crate::registry::{SessionProtocol, SessionRegistry};
use defs::{
    paginate, ApiError, ApiPath, ApiRtmpConn, ApiRtspConn, ApiRtspSession, ApiSrtConn,
    ApiWebRtcSession, PageQuery,
};

#[derive(Clone)]
struct ApiState {
    store: Arc<ConfStore>,
    registry: Arc<SessionRegistry>,
    manager: PathManager,
}

/// Build the `/v3` control router
pub fn router(
    store: Arc<ConfStore>,
    registry: Arc<SessionRegistry>,
    manager: PathManager,
) -> Router {
    let state = ApiState {
        store,
        registry,
        manager,
    };

    Router::new()
        .route("/v3/paths/list", get(paths_list))
        .route("/v3/paths/get/*name", get(paths_get))
        .route("/v3/rtspconns/list", get(rtsp_conns_list))
        .route("/v3/rtspsessions/list", get(rtsp_sessions_list))
        .route("/v3/rtmpconns/list", get(rtmp_conns_list))
        .route("/v3/srtconns/list", get(srt_conns_list))
        .route("/v3/webrtcsessions/list", get(webrtc_sessions_list))
        .route("/v3/config/global/get", get(config_global_get))
        .route("/v3/config/global/patch", patch(config_global_patch))
        .route("/v3/config/pathdefaults/get", get(config_pathdefaults_get))
        .route(
            "/v3/config/pathdefaults/patch",
            patch(config_pathdefaults_patch),
        )
        .route("/v3/config/paths/list", get(config_paths_list))
        .route("/v3/config/paths/get/*name", get(config_paths_get))
        .route("/v3/config/paths/add/*name", post(config_paths_add))
        .route("/v3/config/paths/patch/*name", patch(config_paths_patch))
        .route("/v3/config/paths/delete/*name", delete(config_paths_delete))
        .with_state(state)
}

fn error_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Validation(_) | RelayError::Protocol(_) => StatusCode::BAD_REQUEST,
        RelayError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(err: RelayError) -> Response {
    (
        error_status(&err),
        Json(ApiError {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn paths_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    match state.manager.paths_snapshot().await {
        Ok(snapshots) => {
            let items: Vec<ApiPath> = snapshots.iter().map(ApiPath::from).collect();
            Json(paginate(items, &query)).into_response()
        }
        Err(e) => error_body(e),
    }
}

async fn paths_get(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.manager.get(&name).await {
        Ok(Some(path)) => match path.snapshot().await {
            Ok(snapshot) => Json(ApiPath::from(&snapshot)).into_response(),
            Err(_) => error_body(RelayError::NotFound(name)),
        },
        Ok(None) => error_body(RelayError::NotFound(name)),
        Err(e) => error_body(e),
    }
}

fn sessions_list<T: serde::Serialize + for<'a> From<&'a crate::registry::SessionSnapshot>>(
    state: &ApiState,
    protocol: SessionProtocol,
    query: &PageQuery,
) -> Response {
    let items: Vec<T> = state
        .registry
        .snapshot_by_protocol(protocol)
        .iter()
        .map(T::from)
        .collect();
    Json(paginate(items, query)).into_response()
}

async fn rtsp_conns_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    sessions_list::<ApiRtspConn>(&state, SessionProtocol::RtspConn, &query)
}

async fn rtsp_sessions_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    sessions_list::<ApiRtspSession>(&state, SessionProtocol::RtspSession, &query)
}

async fn rtmp_conns_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    sessions_list::<ApiRtmpConn>(&state, SessionProtocol::RtmpConn, &query)
}

async fn srt_conns_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    sessions_list::<ApiSrtConn>(&state, SessionProtocol::SrtConn, &query)
}

async fn webrtc_sessions_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    sessions_list::<ApiWebRtcSession>(&state, SessionProtocol::WebRtcSession, &query)
}

async fn config_global_get(State(state): State<ApiState>) -> Response {
    Json(state.store.current().conf.clone()).into_response()
}

/// Deep-merge `patch` into `base`; `null` removes a key
fn merge_value(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(key);
                } else {
                    merge_value(base.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Merge a JSON patch into the current document and republish it
fn apply_patch(store: &ConfStore, patch: &Value, under: Option<&str>) -> Result<(), RelayError> {
    if !patch.is_object() {
        return Err(RelayError::Validation(
            "patch body must be a JSON object".to_string(),
        ));
    }

    let current = store.current().conf.clone();
    let mut doc = serde_json::to_value(&current)
        .map_err(|e| RelayError::Internal(format!("conf serialize: {}", e)))?;

    match under {
        Some(key) => {
            let Some(slot) = doc.get_mut(key) else {
                return Err(RelayError::Internal(format!("conf has no {} section", key)));
            };
            merge_value(slot, patch);
        }
        None => merge_value(&mut doc, patch),
    }

    let merged: Conf =
        serde_json::from_value(doc).map_err(|e| RelayError::Validation(e.to_string()))?;
    store.replace(merged)?;
    Ok(())
}

async fn config_global_patch(
    State(state): State<ApiState>,
    Json(patch): Json<Value>,
) -> Response {
    match apply_patch(&state.store, &patch, None) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_body(e),
    }
}

async fn config_pathdefaults_get(State(state): State<ApiState>) -> Response {
    Json(state.store.current().conf.path_defaults.clone()).into_response()
}

async fn config_pathdefaults_patch(
    State(state): State<ApiState>,
    Json(patch): Json<Value>,
) -> Response {
    match apply_patch(&state.store, &patch, Some("pathDefaults")) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_body(e),
    }
}

async fn config_paths_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    let conf = state.store.current().conf.clone();
    let mut names: Vec<String> = conf.paths.keys().cloned().collect();
    names.sort();

    let items: Vec<Value> = names
        .iter()
        .filter_map(|name| {
            let overrides = conf.paths.get(name)?;
            let mut value = serde_json::to_value(overrides).ok()?;
            if let Value::Object(map) = &mut value {
                map.insert("name".to_string(), Value::String(name.clone()));
            }
            Some(value)
        })
        .collect();
    Json(paginate(items, &query)).into_response()
}

async fn config_paths_get(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.current().conf.paths.get(&name) {
        Some(overrides) => Json(overrides.clone()).into_response(),
        None => error_body(RelayError::NotFound(name)),
    }
}

fn parse_path_overrides(body: &Value) -> Result<OptionalPathConf, RelayError> {
    serde_json::from_value(body.clone()).map_err(|e| RelayError::Validation(e.to_string()))
}

async fn config_paths_add(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let overrides = match parse_path_overrides(&body) {
        Ok(overrides) => overrides,
        Err(e) => return error_body(e),
    };

    let mut conf = state.store.current().conf.clone();
    if conf.paths.contains_key(&name) {
        return error_body(RelayError::Validation(format!(
            "path {:?} already exists",
            name
        )));
    }
    conf.paths.insert(name, overrides);

    match state.store.replace(conf) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_body(e),
    }
}

async fn config_paths_patch(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut conf = state.store.current().conf.clone();
    let Some(existing) = conf.paths.get(&name) else {
        return error_body(RelayError::NotFound(name));
    };

    let mut merged = match serde_json::to_value(existing) {
        Ok(value) => value,
        Err(e) => return error_body(RelayError::Internal(e.to_string())),
    };
    merge_value(&mut merged, &body);

    let overrides = match parse_path_overrides(&merged) {
        Ok(overrides) => overrides,
        Err(e) => return error_body(e),
    };
    conf.paths.insert(name, overrides);

    match state.store.replace(conf) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_body(e),
    }
}

async fn config_paths_delete(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Response {
    let mut conf = state.store.current().conf.clone();
    if conf.paths.remove(&name).is_none() {
        return error_body(RelayError::NotFound(name));
    }

    match state.store.replace(conf) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_body(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_value() {
        let mut base = serde_json::json!({
            "logLevel": "info",
            "paths": { "cam1": { "publishUser": "a" } }
        });
        let patch = serde_json::json!({
            "logLevel": "debug",
            "paths": { "cam2": {} }
        });
        merge_value(&mut base, &patch);

        assert_eq!(base["logLevel"], "debug");
        assert_eq!(base["paths"]["cam1"]["publishUser"], "a");
        assert!(base["paths"]["cam2"].is_object());
    }

    #[test]
    fn test_merge_null_removes() {
        let mut base = serde_json::json!({ "a": 1, "b": 2 });
        merge_value(&mut base, &serde_json::json!({ "b": null }));
        assert_eq!(base, serde_json::json!({ "a": 1 }));
    }

    #[test]
    fn test_apply_patch_rejects_unknown_key() {
        let store = ConfStore::new(Conf::default()).unwrap();
        let err = apply_patch(&store, &serde_json::json!({ "bogus": 1 }), None).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        // document unchanged
        assert_eq!(store.current().version, 1);
    }

    #[test]
    fn test_apply_patch_swaps_generation() {
        let store = ConfStore::new(Conf::default()).unwrap();
        apply_patch(&store, &serde_json::json!({ "logLevel": "debug" }), None).unwrap();
        assert_eq!(store.current().version, 2);
        assert_eq!(store.current().conf.log_level, "debug");
    }

    #[test]
    fn test_apply_patch_under_pathdefaults() {
        let store = ConfStore::new(Conf::default()).unwrap();
        apply_patch(
            &store,
            &serde_json::json!({ "readUser": "viewer", "readPass": "pw" }),
            Some("pathDefaults"),
        )
        .unwrap();
        assert_eq!(store.current().conf.path_defaults.read_user, "viewer");
    }
}
