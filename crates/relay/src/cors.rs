// Browser access to the relay's HTTP surface: heartbeat, presence lookup and
// the Prometheus page. `/ws` upgrades and the internal event route are not
// browser traffic but pass through the same layer.

use std::time::Duration;

use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

const REQUEST_ID: &str = "x-request-id";
const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Vite and Next dev servers on both loopback spellings.
const LOCAL_WEB_ORIGINS: &str =
    "http://localhost:3000,http://localhost:5173,http://127.0.0.1:3000,http://127.0.0.1:5173";

/// `origins` is `REVIEWBOX_RELAY_CORS_ORIGINS`: `*`, a comma-separated
/// allowlist, or unset for the local web dev servers. Credentials are only
/// allowed with an explicit allowlist.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, HeaderName::from_static(REQUEST_ID)])
        .expose_headers([HeaderName::from_static(REQUEST_ID)])
        .max_age(PREFLIGHT_MAX_AGE);

    match origins.map(str::trim) {
        Some("*") => layer.allow_origin(AllowOrigin::any()),
        Some(list) => layer.allow_origin(origin_list(list)).allow_credentials(true),
        None => layer.allow_origin(origin_list(LOCAL_WEB_ORIGINS)).allow_credentials(true),
    }
}

fn origin_list(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{cors_layer, origin_list, LOCAL_WEB_ORIGINS};
    use axum::{
        body::Body,
        http::{Method, Request, Response},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    fn relay_shaped_app(origins: Option<&str>) -> Router {
        Router::new()
            .route("/v1/heartbeat", post(|| async { "ok" }))
            .route("/v1/presence/{user_id}", get(|| async { "ok" }))
            .layer(cors_layer(origins))
    }

    async fn preflight(
        origins: Option<&str>,
        uri: &str,
        origin: &str,
        method: &str,
    ) -> Response<Body> {
        relay_shaped_app(origins)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri(uri)
                    .header("origin", origin)
                    .header("access-control-request-method", method)
                    .header("access-control-request-headers", "authorization")
                    .body(Body::empty())
                    .expect("preflight request should build"),
            )
            .await
            .expect("preflight should return a response")
    }

    fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|value| value.to_str().ok())
    }

    #[tokio::test]
    async fn heartbeat_preflight_from_local_dev_server_is_allowed() {
        let response = preflight(None, "/v1/heartbeat", "http://localhost:5173", "POST").await;

        assert_eq!(header(&response, "access-control-allow-origin"), Some("http://localhost:5173"));
        assert_eq!(header(&response, "access-control-allow-credentials"), Some("true"));
        assert_eq!(header(&response, "access-control-max-age"), Some("3600"));
        let allowed_headers = header(&response, "access-control-allow-headers")
            .expect("allowed headers should be listed")
            .to_ascii_lowercase();
        assert!(allowed_headers.contains("authorization"));
    }

    #[tokio::test]
    async fn origins_outside_the_allowlist_get_no_cors_headers() {
        let cases = [
            (None, "https://reviewbox.example"),
            (Some("https://app.reviewbox.dev"), "http://localhost:5173"),
        ];

        for (origins, origin) in cases {
            let response = preflight(origins, "/v1/presence/u1", origin, "GET").await;
            assert_eq!(header(&response, "access-control-allow-origin"), None, "{origin}");
        }
    }

    #[tokio::test]
    async fn configured_allowlist_replaces_dev_defaults() {
        let origins = Some(" https://app.reviewbox.dev , https://staging.reviewbox.dev ");

        let response =
            preflight(origins, "/v1/presence/u1", "https://staging.reviewbox.dev", "GET").await;

        assert_eq!(
            header(&response, "access-control-allow-origin"),
            Some("https://staging.reviewbox.dev")
        );
    }

    #[tokio::test]
    async fn wildcard_never_allows_credentials() {
        let response = preflight(Some("*"), "/v1/heartbeat", "https://any.example", "POST").await;

        assert_eq!(header(&response, "access-control-allow-origin"), Some("*"));
        assert_eq!(header(&response, "access-control-allow-credentials"), None);
    }

    #[tokio::test]
    async fn only_read_and_post_methods_are_advertised() {
        let response = preflight(None, "/v1/heartbeat", "http://127.0.0.1:3000", "POST").await;

        let methods = header(&response, "access-control-allow-methods")
            .expect("allowed methods should be listed");
        assert!(methods.contains("GET") && methods.contains("POST"));
        for absent in ["PUT", "PATCH", "DELETE"] {
            assert!(!methods.contains(absent), "{absent} should not be allowed");
        }
    }

    #[tokio::test]
    async fn request_id_is_readable_by_the_browser() {
        let response = relay_shaped_app(None)
            .oneshot(
                Request::builder()
                    .uri("/v1/presence/u1")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(header(&response, "access-control-expose-headers"), Some("x-request-id"));
    }

    #[test]
    fn origin_list_skips_blank_and_invalid_entries() {
        let origins = origin_list("https://a.example, ,https://b.example,\u{7f}bad,");
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(origin_list(LOCAL_WEB_ORIGINS).len(), 4);
    }
}
