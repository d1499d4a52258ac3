//! Demo endpoints over the cache facade and the session manager.
//!
//! | Route | Body | Effect |
//! |---|---|---|
//! | `POST /cache/save` | `{"name", "value"}` | stores `value` under `name` |
//! | `POST /cache/get` | `{"name"}` | returns the stored value |
//! | `POST /cache/delete` | `{"name"}` | removes `name` |
//! | `POST /cache/empty` | none | removes every key in the namespace |
//! | `GET /session` | none | counts visits in the session |

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::app::App;
use crate::cache::CacheError;
use crate::http::{Method, Request, Response, StatusCode};

#[derive(Debug, Deserialize)]
struct SaveInput {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct NameInput {
    name: String,
}

/// Body of every cache endpoint response.
#[derive(Debug, Serialize)]
struct Reply {
    error: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl Reply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            error: false,
            message: message.into(),
            value: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            error: true,
            ..Self::ok(message)
        }
    }
}

#[derive(Debug, Serialize)]
struct Visits {
    visits: u64,
}

/// Routes one request.
pub async fn handle(app: Arc<App>, request: Request) -> Response {
    match (request.method(), request.path()) {
        (Method::Post, "/cache/save") => save(&app, &request).await,
        (Method::Post, "/cache/get") => get(&app, &request).await,
        (Method::Post, "/cache/delete") => delete(&app, &request).await,
        (Method::Post, "/cache/empty") => empty(&app).await,
        (Method::Get, "/session") => session(&app, &request).await,
        (_, "/cache/save" | "/cache/get" | "/cache/delete" | "/cache/empty" | "/session") => {
            Response::new(StatusCode::MethodNotAllowed)
        }
        _ => Response::new(StatusCode::NotFound).body("Not Found"),
    }
}

async fn save(app: &App, request: &Request) -> Response {
    let input: SaveInput = match request.json() {
        Ok(input) => input,
        Err(e) => return bad_input(e),
    };
    let cache = match app.cache() {
        Ok(cache) => cache,
        Err(e) => return cache_failure(e),
    };
    match cache.set(&input.name, &input.value).await {
        Ok(()) => Response::json(StatusCode::Created, &Reply::ok("Saved in cache")),
        Err(e) => cache_failure(e),
    }
}

async fn get(app: &App, request: &Request) -> Response {
    let input: NameInput = match request.json() {
        Ok(input) => input,
        Err(e) => return bad_input(e),
    };
    let cache = match app.cache() {
        Ok(cache) => cache,
        Err(e) => return cache_failure(e),
    };
    match cache.get::<String>(&input.name).await {
        Ok(value) => Response::json(
            StatusCode::Created,
            &Reply {
                value: Some(value),
                ..Reply::ok("Success")
            },
        ),
        Err(e) if e.is_not_found() => {
            Response::json(StatusCode::Created, &Reply::failed("Not found in cache"))
        }
        Err(e) => cache_failure(e),
    }
}

async fn delete(app: &App, request: &Request) -> Response {
    let input: NameInput = match request.json() {
        Ok(input) => input,
        Err(e) => return bad_input(e),
    };
    let cache = match app.cache() {
        Ok(cache) => cache,
        Err(e) => return cache_failure(e),
    };
    match cache.forget(&input.name).await {
        Ok(()) => Response::json(
            StatusCode::Created,
            &Reply::ok("Deleted entry from cache (if it existed)"),
        ),
        Err(e) => cache_failure(e),
    }
}

async fn empty(app: &App) -> Response {
    let cache = match app.cache() {
        Ok(cache) => cache,
        Err(e) => return cache_failure(e),
    };
    match cache.empty().await {
        Ok(()) => Response::json(StatusCode::Created, &Reply::ok("Emptied cache")),
        Err(e) => cache_failure(e),
    }
}

async fn session(app: &App, request: &Request) -> Response {
    let sessions = app.sessions();
    let cookie = request.cookies().and_then(|h| sessions.cookie_value(h));

    let mut session = match sessions.load(cookie).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "failed to load session");
            return Response::new(StatusCode::InternalServerError);
        }
    };

    let visits = session.data().get::<u64>("visits").unwrap_or(0) + 1;
    let committed = match session.data_mut().put("visits", &visits) {
        Ok(()) => sessions.commit(&mut session).await,
        Err(e) => Err(e),
    };
    match committed {
        Ok(set_cookie) => {
            Response::json(StatusCode::Ok, &Visits { visits }).header("Set-Cookie", set_cookie)
        }
        Err(e) => {
            error!(error = %e, "failed to save session");
            Response::new(StatusCode::InternalServerError)
        }
    }
}

fn bad_input(e: serde_json::Error) -> Response {
    Response::json(
        StatusCode::BadRequest,
        &Reply::failed(format!("invalid request body: {e}")),
    )
}

/// `503` when there is no usable backend, `500` for anything else.
fn cache_failure(e: CacheError) -> Response {
    if e.is_unavailable() {
        warn!(error = %e, "cache unavailable");
        Response::json(StatusCode::ServiceUnavailable, &Reply::failed(e.to_string()))
    } else {
        error!(error = %e, "cache operation failed");
        Response::json(StatusCode::InternalServerError, &Reply::failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use serde_json::Value;

    use super::*;
    use crate::app::AppBuilder;
    use crate::config::Config;

    async fn app(root: &Path, vars: &[(&str, &str)]) -> Arc<App> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        let config = Config::from_lookup(root, |key| vars.get(key).cloned()).unwrap();
        Arc::new(AppBuilder::new(config).build().await.unwrap())
    }

    fn request(method: &str, path: &str, body: &str, cookie: Option<&str>) -> Request {
        let cookie = cookie.map(|c| format!("Cookie: {c}\r\n")).unwrap_or_default();
        let raw = format!(
            "{method} {path} HTTP/1.1\r\nContent-Length: {}\r\n{cookie}\r\n{body}",
            body.len()
        );
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn body(response: &Response) -> Value {
        serde_json::from_slice(response.body_bytes()).unwrap()
    }

    #[tokio::test]
    async fn save_get_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &[("CACHE", "badger")]).await;

        let saved = handle(
            app.clone(),
            request("POST", "/cache/save", r#"{"name":"foo","value":"bar"}"#, None),
        )
        .await;
        assert_eq!(saved.status(), StatusCode::Created);
        assert_eq!(body(&saved)["message"], "Saved in cache");

        let got = handle(app.clone(), request("POST", "/cache/get", r#"{"name":"foo"}"#, None)).await;
        let got = body(&got);
        assert_eq!(got["error"], false);
        assert_eq!(got["value"], "bar");

        let deleted = handle(app.clone(), request("POST", "/cache/delete", r#"{"name":"foo"}"#, None)).await;
        assert_eq!(body(&deleted)["message"], "Deleted entry from cache (if it existed)");

        let missing = handle(app.clone(), request("POST", "/cache/get", r#"{"name":"foo"}"#, None)).await;
        assert_eq!(missing.status(), StatusCode::Created);
        let missing = body(&missing);
        assert_eq!(missing["error"], true);
        assert_eq!(missing["message"], "Not found in cache");
        assert!(missing.get("value").is_none());

        app.shutdown().await;
    }

    #[tokio::test]
    async fn empty_clears_saved_entries() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &[("CACHE", "badger")]).await;
        handle(
            app.clone(),
            request("POST", "/cache/save", r#"{"name":"a","value":"1"}"#, None),
        )
        .await;

        let emptied = handle(app.clone(), request("POST", "/cache/empty", "", None)).await;
        assert_eq!(body(&emptied)["message"], "Emptied cache");
        let got = handle(app.clone(), request("POST", "/cache/get", r#"{"name":"a"}"#, None)).await;
        assert_eq!(body(&got)["error"], true);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn no_cache_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &[]).await;
        let response = handle(app, request("POST", "/cache/get", r#"{"name":"foo"}"#, None)).await;
        assert_eq!(response.status(), StatusCode::ServiceUnavailable);
        assert_eq!(body(&response)["error"], true);
    }

    #[tokio::test]
    async fn bad_json_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &[]).await;
        let response = handle(app, request("POST", "/cache/save", "{", None)).await;
        assert_eq!(response.status(), StatusCode::BadRequest);
    }

    #[tokio::test]
    async fn routing_misses() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &[]).await;
        let wrong_method = handle(app.clone(), request("GET", "/cache/get", "", None)).await;
        assert_eq!(wrong_method.status(), StatusCode::MethodNotAllowed);
        let unknown = handle(app, request("GET", "/nope", "", None)).await;
        assert_eq!(unknown.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn session_counts_visits() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &[("CACHE", "badger"), ("SESSION_TYPE", "badger")]).await;

        let first = handle(app.clone(), request("GET", "/session", "", None)).await;
        assert_eq!(body(&first)["visits"], 1);
        let set_cookie = first.headers().get("set-cookie").unwrap().to_owned();
        let pair = set_cookie.split(';').next().unwrap().to_owned();
        assert!(pair.starts_with("session="));

        let second = handle(app.clone(), request("GET", "/session", "", Some(&pair))).await;
        assert_eq!(body(&second)["visits"], 2);
        assert!(second.headers().get("set-cookie").unwrap().starts_with(&pair));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn cookie_sessions_round_trip_in_the_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &[("COOKIE_NAME", "demo")]).await;

        let first = handle(app.clone(), request("GET", "/session", "", None)).await;
        let pair = first
            .headers()
            .get("set-cookie")
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_owned();
        assert!(pair.starts_with("demo="));

        let second = handle(app, request("GET", "/session", "", Some(&pair))).await;
        assert_eq!(body(&second)["visits"], 2);
    }

    #[tokio::test]
    async fn cookie_sessions_need_the_same_key_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let vars = [("KEY", "abcdefghijklmnopqrstuvwxyz012345")];
        let before = app(dir.path(), &vars).await;

        let first = handle(before, request("GET", "/session", "", None)).await;
        let pair = first
            .headers()
            .get("set-cookie")
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_owned();

        let after = app(dir.path(), &vars).await;
        let second = handle(after, request("GET", "/session", "", Some(&pair))).await;
        assert_eq!(body(&second)["visits"], 2);

        let rekeyed = app(dir.path(), &[("KEY", "a-different-key")]).await;
        let third = handle(rekeyed, request("GET", "/session", "", Some(&pair))).await;
        assert_eq!(body(&third)["visits"], 1);
    }
}
