//! WHIP/WHEP HTTP surface
//!
//! One fallback handler dispatches on method and URL, because path names
//! may contain slashes and therefore do not fit fixed route segments:
//!
//! - `OPTIONS /<path>/{whip|whep}` — capability probe, advertises ICE servers
//! - `POST /<path>/{whip|whep}` — SDP offer in, SDP answer out
//! - `PATCH /<path>/{whip|whep}/<secret>` — trickle-ICE fragment
//! - `DELETE /<path>/{whip|whep}/<secret>` — teardown
//! - `GET /<path>/publish`, `GET /<path>/` — embedded browser pages
//!
//! CORS preflights are told apart from WHIP OPTIONS probes by the presence
//! of `Access-Control-Request-Method`.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use uuid::Uuid;

use super::{sdp, NewSessionReq, WebRtcServer};
use crate::auth::{AccessRequest, AuthAction, AuthProtocol, Authenticator};
use crate::error::{RelayError, TerminateReason};

const PUBLISH_PAGE: &str = include_str!("publish.html");
const READ_PAGE: &str = include_str!("read.html");

/// Largest accepted SDP offer or ICE fragment
const MAX_BODY: usize = 256 * 1024;

const ALLOW_METHODS: &str = "OPTIONS, GET, POST, PATCH, DELETE";
const ALLOW_HEADERS: &str = "Authorization, Content-Type, If-Match";

fn re_endpoint() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/(.+?)/(whip|whep)$").unwrap())
}

fn re_endpoint_with_secret() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/(.+?)/(whip|whep)/(.+?)$").unwrap())
}

struct HttpState {
    server: Arc<WebRtcServer>,
    auth: Authenticator,
}

/// Build the WHIP/WHEP router
pub fn router(server: Arc<WebRtcServer>) -> Router {
    let auth = Authenticator::new(Arc::clone(&server.store));
    let state = Arc::new(HttpState { server, auth });
    Router::new().fallback(handle).with_state(state)
}

/// Basic credentials from the `Authorization` header, if any
fn basic_auth(req: &Request) -> (Option<String>, Option<String>) {
    let Some(value) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return (None, None);
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return (None, None);
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return (None, None);
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return (None, None);
    };
    match text.split_once(':') {
        Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
        None => (Some(text), None),
    }
}

fn content_type_is(req: &Request, expected: &str) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == expected)
        .unwrap_or(false)
}

struct ResponseBuilder {
    builder: axum::http::response::Builder,
}

impl ResponseBuilder {
    fn new(status: StatusCode, allow_origin: &str) -> Self {
        let builder = Response::builder()
            .status(status)
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin)
            .header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        Self { builder }
    }

    fn header(mut self, name: &str, value: &str) -> Self {
        self.builder = self.builder.header(name, value);
        self
    }

    fn links(mut self, links: &[String]) -> Self {
        for link in links {
            self.builder = self.builder.header(header::LINK, link);
        }
        self
    }

    fn empty(self) -> Response {
        self.body(Body::empty())
    }

    fn body(self, body: Body) -> Response {
        match self.builder.body(body) {
            Ok(res) => res,
            Err(e) => {
                tracing::error!(error = %e, "response build failed");
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            }
        }
    }
}

/// Translate a core error to the WHIP/WHEP wire
fn error_response(err: &RelayError, allow_origin: &str) -> Response {
    let status = match err {
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Auth { .. } => StatusCode::UNAUTHORIZED,
        RelayError::Terminated(TerminateReason::Timeout) => StatusCode::REQUEST_TIMEOUT,
        RelayError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };

    let mut builder = ResponseBuilder::new(status, allow_origin);
    if matches!(err, RelayError::Auth { challenge: true }) {
        builder = builder.header("WWW-Authenticate", "Basic realm=\"mediamtx\"");
    }
    builder.empty()
}

async fn handle(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let conf = state.server.store.current();
    let allow_origin = conf.conf.allow_origin.clone();
    let ice_servers = conf.conf.ice_servers.clone();
    drop(conf);

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // CORS preflight, distinguished from a WHIP OPTIONS probe by this header
    if method == Method::OPTIONS
        && req.headers().contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    {
        return ResponseBuilder::new(StatusCode::NO_CONTENT, &allow_origin)
            .header("Access-Control-Allow-Methods", ALLOW_METHODS)
            .header("Access-Control-Allow-Headers", ALLOW_HEADERS)
            .empty();
    }

    if let Some(captures) = re_endpoint().captures(&path) {
        let name = captures[1].to_string();
        let publish = &captures[2] == "whip";

        return if method == Method::OPTIONS {
            let (user, pass) = basic_auth(&req);
            endpoint_options(&state, &name, publish, remote, user, pass, &allow_origin, &ice_servers)
                .await
        } else if method == Method::POST {
            endpoint_post(&state, name, publish, remote, req, &allow_origin, &ice_servers).await
        } else if method == Method::GET || method == Method::HEAD || method == Method::PUT {
            // WHIP endpoints answer GET, HEAD and PUT with 405
            ResponseBuilder::new(StatusCode::METHOD_NOT_ALLOWED, &allow_origin).empty()
        } else {
            ResponseBuilder::new(StatusCode::NOT_FOUND, &allow_origin).empty()
        };
    }

    if let Some(captures) = re_endpoint_with_secret().captures(&path) {
        let secret = captures[3].to_string();

        return if method == Method::PATCH {
            endpoint_patch(&state, &secret, req, &allow_origin).await
        } else if method == Method::DELETE {
            endpoint_delete(&state, &secret, &allow_origin).await
        } else {
            ResponseBuilder::new(StatusCode::METHOD_NOT_ALLOWED, &allow_origin).empty()
        };
    }

    if method == Method::GET {
        let (user, pass) = basic_auth(&req);
        return pages(&state, &path, remote, user, pass, &allow_origin).await;
    }

    ResponseBuilder::new(StatusCode::NOT_FOUND, &allow_origin).empty()
}

/// Authentication shared by OPTIONS probes and the embedded pages
async fn check_auth(
    state: &HttpState,
    name: &str,
    publish: bool,
    remote: SocketAddr,
    user: Option<String>,
    pass: Option<String>,
) -> Result<(), RelayError> {
    state
        .auth
        .check(&AccessRequest {
            name: name.to_string(),
            action: if publish {
                AuthAction::Publish
            } else {
                AuthAction::Read
            },
            user,
            pass,
            ip: remote.ip(),
            proto: AuthProtocol::WebRtc,
        })
        .await
}

#[allow(clippy::too_many_arguments)]
async fn endpoint_options(
    state: &HttpState,
    name: &str,
    publish: bool,
    remote: SocketAddr,
    user: Option<String>,
    pass: Option<String>,
    allow_origin: &str,
    ice_servers: &[String],
) -> Response {
    if let Err(e) = check_auth(state, name, publish, remote, user, pass).await {
        return error_response(&e, allow_origin);
    }

    ResponseBuilder::new(StatusCode::NO_CONTENT, allow_origin)
        .header("Access-Control-Allow-Methods", ALLOW_METHODS)
        .header("Access-Control-Allow-Headers", ALLOW_HEADERS)
        .header("Access-Control-Expose-Headers", "Link")
        .links(&sdp::ice_server_links(ice_servers))
        .empty()
}

#[allow(clippy::too_many_arguments)]
async fn endpoint_post(
    state: &HttpState,
    name: String,
    publish: bool,
    remote: SocketAddr,
    req: Request,
    allow_origin: &str,
    ice_servers: &[String],
) -> Response {
    if !content_type_is(&req, "application/sdp") {
        return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty();
    }

    let (user, pass) = basic_auth(&req);
    let offer = match to_bytes(req.into_body(), MAX_BODY).await {
        Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => text,
            Err(_) => {
                return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty()
            }
        },
        Err(_) => return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty(),
    };

    let res = state
        .server
        .new_session(NewSessionReq {
            path: name.clone(),
            publish,
            offer,
            remote_addr: remote,
            user,
            pass,
        })
        .await;

    let res = match res {
        Ok(res) => res,
        Err(e) => return error_response(&e, allow_origin),
    };

    let kind = if publish { "whip" } else { "whep" };
    let location = format!("/{}/{}/{}", name, kind, res.secret);

    ResponseBuilder::new(StatusCode::CREATED, allow_origin)
        .header("Content-Type", "application/sdp")
        .header(
            "Access-Control-Expose-Headers",
            "ETag, Accept-Patch, Link, Location",
        )
        .header("ETag", "*")
        .header("ID", &res.id.to_string())
        .header("Accept-Patch", "application/trickle-ice-sdpfrag")
        .header("Location", &location)
        .links(&sdp::ice_server_links(ice_servers))
        .body(Body::from(res.answer))
}

async fn endpoint_patch(
    state: &HttpState,
    secret: &str,
    req: Request,
    allow_origin: &str,
) -> Response {
    let Ok(secret) = Uuid::parse_str(secret) else {
        return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty();
    };
    if !content_type_is(&req, "application/trickle-ice-sdpfrag") {
        return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty();
    }

    let body = match to_bytes(req.into_body(), MAX_BODY).await {
        Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => text,
            Err(_) => {
                return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty()
            }
        },
        Err(_) => return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty(),
    };

    let candidates = match sdp::parse_ice_fragment(&body) {
        Ok(candidates) => candidates,
        Err(_) => return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty(),
    };

    match state.server.add_candidates(secret, candidates).await {
        Ok(()) => ResponseBuilder::new(StatusCode::NO_CONTENT, allow_origin).empty(),
        Err(_) => ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty(),
    }
}

async fn endpoint_delete(state: &HttpState, secret: &str, allow_origin: &str) -> Response {
    let Ok(secret) = Uuid::parse_str(secret) else {
        return ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty();
    };

    match state.server.delete_session(secret).await {
        Ok(()) => ResponseBuilder::new(StatusCode::OK, allow_origin).empty(),
        Err(_) => ResponseBuilder::new(StatusCode::BAD_REQUEST, allow_origin).empty(),
    }
}

/// Embedded publish/read pages plus the trailing-slash redirect
async fn pages(
    state: &HttpState,
    path: &str,
    remote: SocketAddr,
    user: Option<String>,
    pass: Option<String>,
    allow_origin: &str,
) -> Response {
    if path == "/" || path == "/favicon.ico" {
        return ResponseBuilder::new(StatusCode::NOT_FOUND, allow_origin).empty();
    }

    let (name, publish, page) = if let Some(name) = path
        .strip_prefix('/')
        .and_then(|p| p.strip_suffix("/publish"))
    {
        (name.to_string(), true, PUBLISH_PAGE)
    } else if let Some(name) = path.strip_prefix('/').and_then(|p| p.strip_suffix('/')) {
        (name.to_string(), false, READ_PAGE)
    } else {
        // normalize to a trailing slash so relative URLs on the page work
        let location = format!("{}/", path);
        return ResponseBuilder::new(StatusCode::MOVED_PERMANENTLY, allow_origin)
            .header("Location", &location)
            .empty();
    };

    if name.is_empty() {
        return ResponseBuilder::new(StatusCode::NOT_FOUND, allow_origin).empty();
    }
    if let Err(e) = check_auth(state, &name, publish, remote, user, pass).await {
        return error_response(&e, allow_origin);
    }

    ResponseBuilder::new(StatusCode::OK, allow_origin)
        .header("Cache-Control", "max-age=3600")
        .header("Content-Type", "text/html")
        .body(Body::from(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_endpoint_regexes() {
        let re = re_endpoint();
        let caps = re.captures("/cam1/whip").unwrap();
        assert_eq!(&caps[1], "cam1");
        assert_eq!(&caps[2], "whip");

        // multi-segment path names are routable
        let caps = re.captures("/floor2/cam1/whep").unwrap();
        assert_eq!(&caps[1], "floor2/cam1");
        assert_eq!(&caps[2], "whep");

        assert!(re.captures("/whip").is_none());

        let re = re_endpoint_with_secret();
        let caps = re
            .captures("/cam1/whip/6a9c1b2a-0d8c-4b2e-9f5a-1b2c3d4e5f60")
            .unwrap();
        assert_eq!(&caps[2], "whip");
        assert_eq!(&caps[3], "6a9c1b2a-0d8c-4b2e-9f5a-1b2c3d4e5f60");
    }

    #[test]
    fn test_basic_auth_parsing() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/x")
            .header("Authorization", "Basic YWRtaW46c2VjcmV0")
            .body(Body::empty())
            .unwrap();
        let (user, pass) = basic_auth(&req);
        assert_eq!(user.as_deref(), Some("admin"));
        assert_eq!(pass.as_deref(), Some("secret"));

        let (user, pass) = basic_auth(&get("/x"));
        assert!(user.is_none() && pass.is_none());

        let req = Request::builder()
            .method(Method::GET)
            .uri("/x")
            .header("Authorization", "Bearer whatever")
            .body(Body::empty())
            .unwrap();
        assert_eq!(basic_auth(&req), (None, None));
    }

    #[test]
    fn test_content_type_check() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/cam1/whip")
            .header("Content-Type", "application/sdp; charset=utf-8")
            .body(Body::empty())
            .unwrap();
        assert!(content_type_is(&req, "application/sdp"));
        assert!(!content_type_is(&req, "application/trickle-ice-sdpfrag"));
    }
}
