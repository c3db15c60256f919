// HTTP gateway
//
// Routes, in match order:
// - GET  /env.json, /env.mjs   file passthrough from the working directory
// - GET  /api/status           node and queue status as JSON
// - GET  /*                    file from the public dir, else the landing page
// - POST /*                    logged and acknowledged
//
// Every handler runs inside the admission queue and a queue error becomes
// a JSON reply right there, so it still passes through the CORS wrapper.
// CORS preflights are answered by that wrapper and never reach the queue.
// Whatever else is rejected is mapped to JSON by `handle_rejection`.

use orgrelay_core::{
    AddressAnnouncer, AdmissionError, AdmissionQueue, AdmissionStats, NatStatus, OverlayNodeHandle,
};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use warp::filters::cors::{Builder as CorsBuilder, CorsForbidden};
use warp::http::StatusCode;
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// The landing page HTML, compiled into the binary.
const LANDING_HTML: &str = include_str!("landing.html");

/// Everything the handlers need, shared across requests.
pub struct GatewayContext {
    pub node: OverlayNodeHandle,
    pub announcer: AddressAnnouncer,
    pub queue: AdmissionQueue,
    pub public_dir: PathBuf,
    /// Where env.json / env.mjs live
    pub env_dir: PathBuf,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Serialize)]
struct StatusResponse {
    peer_id: String,
    address: String,
    listen_addrs: Vec<String>,
    nat: NatStatus,
    connected_peers: usize,
    queue: QueueStatus,
    uptime_seconds: u64,
    version: &'static str,
}

#[derive(Serialize)]
struct QueueStatus {
    #[serde(flatten)]
    stats: AdmissionStats,
    workers: usize,
    max_queue_size: usize,
}

pub fn routes(
    ctx: Arc<GatewayContext>,
    cors_origins: &[String],
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone + Send + Sync + 'static {
    let ctx_public_dir = ctx.public_dir.clone();
    let with_ctx = warp::any().map(move || ctx.clone());

    let env_json = warp::get()
        .and(warp::path("env.json"))
        .and(warp::path::end())
        .and(with_ctx.clone())
        .and_then(|ctx| env_file(ctx, "env.json", "application/json"))
        .boxed();

    let env_mjs = warp::get()
        .and(warp::path("env.mjs"))
        .and(warp::path::end())
        .and(with_ctx.clone())
        .and_then(|ctx| env_file(ctx, "env.mjs", "text/javascript; charset=utf-8"))
        .boxed();

    let status = warp::path!("api" / "status")
        .and(warp::get())
        .and(with_ctx.clone())
        .and_then(handle_status)
        .boxed();

    // warp::fs::dir decodes the path and refuses traversal; missing files
    // and directories without an index fall through to the landing page
    let files = warp::get()
        .and(warp::fs::dir(ctx_public_dir))
        .and(with_ctx.clone())
        .and_then(handle_file)
        .boxed();

    let landing = warp::get()
        .and(with_ctx.clone())
        .and_then(handle_landing)
        .boxed();

    let post = warp::post()
        .and(warp::path::full())
        .and(with_ctx)
        .and_then(handle_post)
        .boxed();

    env_json
        .or(env_mjs)
        .unify()
        .or(status)
        .unify()
        .or(files)
        .unify()
        .or(landing)
        .unify()
        .or(post)
        .unify()
        .with(cors(cors_origins))
        .recover(handle_rejection)
}

fn cors(origins: &[String]) -> CorsBuilder {
    let builder = warp::cors()
        .allow_credentials(true)
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["content-type", "authorization"]);

    if origins.iter().any(|o| o == "*") {
        builder.allow_any_origin()
    } else {
        builder.allow_origins(origins.iter().map(String::as_str))
    }
}

/// Run `job` through the admission queue. A queue error is answered here
/// rather than rejected, so no later route gets to handle the request.
async fn admitted<F>(queue: &AdmissionQueue, job: F) -> Result<Response, Rejection>
where
    F: Future<Output = Response> + Send + 'static,
{
    Ok(match queue.submit(job).await {
        Ok(response) => response,
        Err(e) => queue_error_reply(&e),
    })
}

fn queue_error_reply(e: &AdmissionError) -> Response {
    let (status, error) = match e {
        AdmissionError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
        AdmissionError::RequestTimeout { .. } => (StatusCode::REQUEST_TIMEOUT, "request_timeout"),
        AdmissionError::Aborted => (StatusCode::INTERNAL_SERVER_ERROR, "aborted"),
    };
    error_reply(status, error, e.to_string())
}

fn error_reply(status: StatusCode, error: &'static str, message: String) -> Response {
    let body = warp::reply::json(&ErrorBody { error, message });
    warp::reply::with_status(body, status).into_response()
}

async fn env_file(
    ctx: Arc<GatewayContext>,
    name: &'static str,
    content_type: &'static str,
) -> Result<Response, Rejection> {
    let path = ctx.env_dir.join(name);
    admitted(&ctx.queue, async move {
        match tokio::fs::read(&path).await {
            Ok(bytes) => warp::reply::with_header(bytes, "content-type", content_type).into_response(),
            Err(e) => {
                tracing::debug!(path = %path.display(), "Env file unavailable: {}", e);
                StatusCode::NOT_FOUND.into_response()
            }
        }
    })
    .await
}

async fn handle_status(ctx: Arc<GatewayContext>) -> Result<Response, Rejection> {
    let job_ctx = ctx.clone();
    admitted(&ctx.queue, async move {
        let ctx = job_ctx;
        let status = StatusResponse {
            peer_id: ctx.node.peer_id().to_string(),
            address: ctx.announcer.current_address().to_string(),
            listen_addrs: ctx
                .node
                .listen_addrs()
                .iter()
                .map(ToString::to_string)
                .collect(),
            nat: ctx.node.nat_status(),
            connected_peers: ctx.node.connected_peers().len(),
            queue: QueueStatus {
                stats: ctx.queue.stats(),
                workers: ctx.queue.config().concurrent_workers,
                max_queue_size: ctx.queue.config().max_queue_size,
            },
            uptime_seconds: ctx.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
        };
        warp::reply::json(&status).into_response()
    })
    .await
}

/// The file itself is already opened by warp; sending it is the queued work.
async fn handle_file(
    file: warp::fs::File,
    ctx: Arc<GatewayContext>,
) -> Result<Response, Rejection> {
    admitted(&ctx.queue, async move { file.into_response() }).await
}

async fn handle_landing(ctx: Arc<GatewayContext>) -> Result<Response, Rejection> {
    let announcer = ctx.announcer.clone();
    admitted(&ctx.queue, async move {
        warp::reply::html(landing_page(announcer.current_address())).into_response()
    })
    .await
}

async fn handle_post(path: FullPath, ctx: Arc<GatewayContext>) -> Result<Response, Rejection> {
    let path = path.as_str().to_string();
    admitted(&ctx.queue, async move {
        tracing::info!(path = %path, "POST received");
        StatusCode::OK.into_response()
    })
    .await
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let reply = if let Some(e) = err.find::<CorsForbidden>() {
        tracing::debug!("CORS request refused: {}", e);
        error_reply(StatusCode::FORBIDDEN, "cors_rejected", e.to_string())
    } else if err.is_not_found() {
        error_reply(StatusCode::NOT_FOUND, "not_found", "not found".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        error_reply(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "method not allowed".to_string(),
        )
    } else {
        tracing::warn!("Unhandled rejection: {:?}", err);
        error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal error".to_string(),
        )
    };
    Ok(reply)
}

pub fn landing_page(address: &str) -> String {
    LANDING_HTML.replace("{{ADDRESS}}", &escape_html(address))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgrelay_core::{
        start_node, AddressSelection, AdmissionConfig, NodeAddresses, OverlayOptions,
        PeerIdentity, TimeoutPolicy,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        ctx: Arc<GatewayContext>,
        dir: tempfile::TempDir,
    }

    async fn fixture(admission: AdmissionConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("public")).unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let (node, _) = start_node(
            &PeerIdentity::generate(),
            NodeAddresses::listen_only("/ip4/127.0.0.1/tcp/0".parse().unwrap()),
            &[] as &[&str],
            OverlayOptions::default(),
            tx,
        )
        .await
        .unwrap();

        let ctx = Arc::new(GatewayContext {
            node,
            announcer: AddressAnnouncer::new(AddressSelection::First),
            queue: AdmissionQueue::new(admission),
            public_dir: dir.path().join("public"),
            env_dir: dir.path().to_path_buf(),
            started_at: Instant::now(),
        });
        Fixture { ctx, dir }
    }

    fn any_origin() -> Vec<String> {
        vec!["*".to_string()]
    }

    fn body(res: &warp::http::Response<impl AsRef<[u8]>>) -> String {
        String::from_utf8_lossy(res.body().as_ref()).into_owned()
    }

    #[tokio::test]
    async fn test_landing_page_embeds_address() {
        let f = fixture(AdmissionConfig::default()).await;
        let api = routes(f.ctx.clone(), &any_origin());

        let res = warp::test::request().path("/").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert!(body(&res).contains("<p></p>"));

        let announced = f.ctx.announcer.capture(&f.ctx.node.multiaddrs()).unwrap();
        let res = warp::test::request().path("/some/page").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert!(body(&res).contains(&format!("<p>{announced}</p>")));
    }

    #[tokio::test]
    async fn test_public_files_are_served() {
        let f = fixture(AdmissionConfig::default()).await;
        std::fs::write(f.dir.path().join("public/app.css"), "body {}").unwrap();
        std::fs::write(f.dir.path().join("secret.txt"), "hunter2").unwrap();
        let api = routes(f.ctx.clone(), &any_origin());

        let res = warp::test::request().path("/app.css").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert!(res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/css"));
        assert_eq!(body(&res), "body {}");

        // traversal attempts land on the landing page, never outside public/
        for path in ["/../secret.txt", "/%2e%2e/secret.txt", "/..%2fsecret.txt"] {
            let res = warp::test::request().path(path).reply(&api).await;
            assert!(!body(&res).contains("hunter2"), "{path} leaked");
        }
    }

    #[tokio::test]
    async fn test_percent_encoded_file_names() {
        let f = fixture(AdmissionConfig::default()).await;
        std::fs::write(f.dir.path().join("public/my logo.css"), "body {}").unwrap();
        std::fs::create_dir(f.dir.path().join("public/assets")).unwrap();
        std::fs::write(f.dir.path().join("public/assets/caf\u{e9}.js"), "ok()").unwrap();
        let api = routes(f.ctx.clone(), &any_origin());

        let res = warp::test::request().path("/my%20logo.css").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert!(res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/css"));
        assert_eq!(body(&res), "body {}");

        let res = warp::test::request()
            .path("/assets/caf%C3%A9.js")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 200);
        assert_eq!(body(&res), "ok()");

        // a directory without an index is the landing page
        let res = warp::test::request().path("/assets").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert!(body(&res).contains("This is a relay"));
    }

    #[tokio::test]
    async fn test_missing_file_is_landing_page() {
        let f = fixture(AdmissionConfig::default()).await;
        let api = routes(f.ctx.clone(), &any_origin());

        let res = warp::test::request().path("/no/such/file.png").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert!(body(&res).contains("This is a relay"));
    }

    #[tokio::test]
    async fn test_env_passthrough() {
        let f = fixture(AdmissionConfig::default()).await;
        std::fs::write(f.dir.path().join("env.json"), r#"{"relay":true}"#).unwrap();
        let api = routes(f.ctx.clone(), &any_origin());

        let res = warp::test::request().path("/env.json").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.headers()["content-type"], "application/json");
        assert_eq!(body(&res), r#"{"relay":true}"#);

        let res = warp::test::request().path("/env.mjs").reply(&api).await;
        assert_eq!(res.status(), 404);
    }

    #[tokio::test]
    async fn test_status_json() {
        let f = fixture(AdmissionConfig::default()).await;
        f.ctx.announcer.capture(&f.ctx.node.multiaddrs());
        let api = routes(f.ctx.clone(), &any_origin());

        let res = warp::test::request().path("/api/status").reply(&api).await;
        assert_eq!(res.status(), 200);

        let json: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(json["peer_id"], f.ctx.node.peer_id().to_string());
        assert_eq!(json["address"], f.ctx.announcer.current_address());
        assert_eq!(json["connected_peers"], 0);
        let listen = json["listen_addrs"].as_array().unwrap();
        assert_eq!(listen.len(), 1);
        assert!(listen[0].as_str().unwrap().starts_with("/ip4/127.0.0.1/tcp/"));
        // the status request itself is the one running job
        assert_eq!(json["queue"]["running"], 1);
        assert_eq!(json["queue"]["waiting"], 0);
        assert_eq!(json["queue"]["workers"], 4);
        assert_eq!(json["queue"]["max_queue_size"], 200);
        assert!(json["version"].is_string());
        assert!(json["uptime_seconds"].is_u64());
        assert!(json.get("nat").is_some());
    }

    #[tokio::test]
    async fn test_post_is_acknowledged() {
        let f = fixture(AdmissionConfig::default()).await;
        let api = routes(f.ctx.clone(), &any_origin());

        let res = warp::test::request()
            .method("POST")
            .path("/anything")
            .body(r#"{"hello":"relay"}"#)
            .reply(&api)
            .await;
        assert_eq!(res.status(), 200);
        assert!(res.body().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_is_503() {
        let f = fixture(AdmissionConfig {
            max_queue_size: 0,
            ..AdmissionConfig::default()
        })
        .await;
        let api = routes(f.ctx.clone(), &any_origin());

        let res = warp::test::request().path("/").reply(&api).await;
        assert_eq!(res.status(), 503);
        let json: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(json["error"], "queue_full");
    }

    #[tokio::test]
    async fn test_queue_errors_carry_cors_headers() {
        let f = fixture(AdmissionConfig {
            max_queue_size: 0,
            ..AdmissionConfig::default()
        })
        .await;
        std::fs::write(f.dir.path().join("public/app.css"), "body {}").unwrap();
        let api = routes(f.ctx.clone(), &["https://app.example.org".to_string()]);

        for path in ["/", "/app.css", "/api/status", "/env.json"] {
            let res = warp::test::request()
                .path(path)
                .header("origin", "https://app.example.org")
                .reply(&api)
                .await;
            assert_eq!(res.status(), 503, "{path}");
            assert_eq!(
                res.headers()["access-control-allow-origin"],
                "https://app.example.org",
                "{path}"
            );
            let json: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
            assert_eq!(json["error"], "queue_full");
        }

        let res = warp::test::request()
            .method("POST")
            .path("/submit")
            .header("origin", "https://app.example.org")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 503);
        assert!(res.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_preflight_does_not_take_a_queue_slot() {
        let f = fixture(AdmissionConfig {
            max_queue_size: 0,
            ..AdmissionConfig::default()
        })
        .await;
        let api = routes(f.ctx.clone(), &["https://app.example.org".to_string()]);

        let res = warp::test::request()
            .method("OPTIONS")
            .path("/submit")
            .header("origin", "https://app.example.org")
            .header("access-control-request-method", "POST")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 200);
        assert_eq!(
            res.headers()["access-control-allow-origin"],
            "https://app.example.org"
        );
    }

    #[tokio::test]
    async fn test_slow_queue_is_408() {
        let f = fixture(AdmissionConfig {
            concurrent_workers: 1,
            max_queue_size: 4,
            timeout: Duration::from_millis(100),
            timeout_policy: TimeoutPolicy::Detach,
        })
        .await;
        let api = routes(f.ctx.clone(), &any_origin());

        // hold the only worker
        let queue = f.ctx.queue.clone();
        let blocker = tokio::spawn(async move {
            queue
                .submit(tokio::time::sleep(Duration::from_millis(500)))
                .await
        });
        while f.ctx.queue.stats().running == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let res = warp::test::request().path("/").reply(&api).await;
        assert_eq!(res.status(), 408);
        let json: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(json["error"], "request_timeout");

        let _ = blocker.await.unwrap();
    }

    #[tokio::test]
    async fn test_cors_allow_list() {
        let f = fixture(AdmissionConfig::default()).await;
        let api = routes(f.ctx.clone(), &["https://app.example.org".to_string()]);

        let res = warp::test::request()
            .path("/")
            .header("origin", "https://evil.example.com")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 403);
        let json: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(json["error"], "cors_rejected");

        let res = warp::test::request()
            .path("/")
            .header("origin", "https://app.example.org")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 200);
        assert_eq!(
            res.headers()["access-control-allow-origin"],
            "https://app.example.org"
        );
        assert_eq!(res.headers()["access-control-allow-credentials"], "true");
    }

    #[test]
    fn test_landing_page_escapes_address() {
        let html = landing_page("<script>");
        assert!(html.contains("<p>&lt;script&gt;</p>"));
        assert!(!html.contains("{{ADDRESS}}"));
    }
}
