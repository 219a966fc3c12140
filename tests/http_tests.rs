//! HTTP handler tests
//!
//! Handlers are invoked directly with their extractors so the dispatch of
//! `/libs/{*rest}`, status codes and response bodies can be checked without
//! binding a socket.

use axum::{
    body::to_bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use imgshelf::{
    config::AppConfig,
    error::AppError,
    library::{CustomizationsStore, LibraryIndex, Rating, RatingsStore},
    state::AppState,
    web::{
        self,
        handlers::{
            self, CustomizationRequest, DeleteRequest, ListQuery, RateRequest, VersionQuery,
        },
    },
};
use serde_json::{json, Value};
use std::fs;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestServer {
    state: AppState,
    base: TempDir,
    _data: TempDir,
}

impl TestServer {
    fn new(files: &[&str]) -> Self {
        let base = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        for file in files {
            let path = base.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            if file.ends_with(".png") {
                image::RgbImage::new(8, 4).save(&path).unwrap();
            } else {
                fs::write(&path, b"0123456789").unwrap();
            }
        }

        let mut config = AppConfig::default();
        config.library.base_path = base.path().to_path_buf();
        config.library.data_dir = data.path().to_path_buf();
        config.library.watch_today = false;
        config.server.version_tag = Some("test-tag".to_string());

        let ratings = Arc::new(RatingsStore::new(data.path(), config.write_debounce()));
        let customizations = Arc::new(CustomizationsStore::new(data.path(), config.write_debounce()));
        let library = Arc::new(
            LibraryIndex::open(base.path(), ratings, customizations, config.folder_options(None))
                .unwrap(),
        );
        let version_tag = config.resolve_version_tag().into();

        Self {
            state: AppState {
                config: Arc::new(config),
                library,
                version_tag,
            },
            base,
            _data: data,
        }
    }

    fn base(&self) -> &FsPath {
        self.base.path()
    }

    async fn get(&self, rest: &str, query: ListQuery, headers: HeaderMap) -> Result<Response, AppError> {
        handlers::libs_get_handler(State(self.state.clone()), Path(rest.to_string()), Query(query), headers)
            .await
    }

    async fn rate(&self, rest: &str, body: Value) -> Result<StatusCode, AppError> {
        let request: RateRequest = serde_json::from_value(body).unwrap();
        handlers::libs_post_handler(State(self.state.clone()), Path(rest.to_string()), Ok(Json(request)))
            .await
    }
}

fn ratings_query(ratings: &str) -> ListQuery {
    ListQuery {
        ratings: Some(ratings.to_string()),
        recursive: None,
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

fn file_names(listing: &Value) -> Vec<String> {
    listing["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["file"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_router_builds() {
    let server = TestServer::new(&["day1/a.png"]);
    let _router = web::create_router(server.state.clone());
}

#[cfg(test)]
mod listing_tests {
    use super::*;

    #[tokio::test]
    async fn test_libs_tree_snapshot() {
        let server = TestServer::new(&["2024/day1/a.png", "cover.png"]);
        let response = handlers::list_libraries(State(server.state.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["root"]["path"], "__root__");
        assert_eq!(body["folders"][0]["path"], "2024");
        assert_eq!(body["folders"][0]["hasImages"], false);
        assert_eq!(body["folders"][0]["children"][0]["path"], "2024/day1");
        assert_eq!(body["folders"][0]["children"][0]["hasImages"], true);
        assert!(body["customizations"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_library_listing_with_nested_id() {
        let server = TestServer::new(&["2024/day1/b.png", "2024/day1/a.png"]);
        let response = server
            .get("2024/day1", ListQuery::default(), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::ETAG));

        let body = body_json(response).await;
        assert_eq!(body["name"], "day1");
        assert_eq!(file_names(&body), vec!["a.png", "b.png"]);
        assert_eq!(body["files"][0]["library"], "2024/day1");
    }

    #[tokio::test]
    async fn test_rating_filter_and_fallback() {
        let server = TestServer::new(&["day1/a.png", "day1/b.png", "day1/c.png"]);
        assert_eq!(server.rate("day1/rate", json!({"img": "a.png", "rating": 5})).await.unwrap(), StatusCode::OK);
        assert_eq!(server.rate("day1/rate", json!({"img": "c.png", "rating": 3})).await.unwrap(), StatusCode::OK);

        let body = body_json(server.get("day1", ratings_query("5,3"), HeaderMap::new()).await.unwrap()).await;
        assert_eq!(file_names(&body), vec!["a.png", "c.png"]);
        assert_eq!(body["files"][0]["rating"], 5);

        let body = body_json(server.get("day1", ratings_query("5"), HeaderMap::new()).await.unwrap()).await;
        assert_eq!(file_names(&body), vec!["a.png"]);

        for malformed in ["abc", "9", "", "1,x"] {
            let body = body_json(server.get("day1", ratings_query(malformed), HeaderMap::new()).await.unwrap()).await;
            assert_eq!(file_names(&body).len(), 3, "filter {:?} should fall back", malformed);
        }
    }

    #[tokio::test]
    async fn test_recursive_listing() {
        let server = TestServer::new(&["day1/a.png", "day1/extra/b.png"]);
        let query = ListQuery {
            ratings: None,
            recursive: Some("true".to_string()),
        };
        let body = body_json(server.get("day1", query, HeaderMap::new()).await.unwrap()).await;
        assert_eq!(file_names(&body), vec!["a.png", "extra/b.png"]);
    }

    #[tokio::test]
    async fn test_recursive_etag_tracks_nested_changes() {
        let server = TestServer::new(&["day1/a.png", "day1/extra/b.png"]);
        let recursive = || ListQuery {
            ratings: None,
            recursive: Some("true".to_string()),
        };
        let first = server.get("day1", recursive(), HeaderMap::new()).await.unwrap();
        let etag = first.headers().get(header::ETAG).unwrap().clone();

        fs::write(server.base().join("day1/extra/c.png"), b"png").unwrap();

        let mut conditional = HeaderMap::new();
        conditional.insert(header::IF_NONE_MATCH, etag.clone());
        let changed = server.get("day1", recursive(), conditional).await.unwrap();
        assert_eq!(changed.status(), StatusCode::OK);
        let new_etag = changed.headers().get(header::ETAG).unwrap().clone();
        assert_ne!(new_etag, etag);
        let body = body_json(changed).await;
        assert_eq!(file_names(&body), vec!["a.png", "extra/b.png", "extra/c.png"]);

        let mut conditional = HeaderMap::new();
        conditional.insert(header::IF_NONE_MATCH, new_etag);
        let unchanged = server.get("day1", recursive(), conditional).await.unwrap();
        assert_eq!(unchanged.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_etag_not_modified_until_rating_changes() {
        let server = TestServer::new(&["day1/a.png"]);
        let first = server.get("day1", ListQuery::default(), HeaderMap::new()).await.unwrap();
        let etag = first.headers().get(header::ETAG).unwrap().clone();

        let mut conditional = HeaderMap::new();
        conditional.insert(header::IF_NONE_MATCH, etag.clone());
        let second = server.get("day1", ListQuery::default(), conditional.clone()).await.unwrap();
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);

        let filtered = server.get("day1", ratings_query("5"), conditional.clone()).await.unwrap();
        assert_eq!(filtered.status(), StatusCode::OK);

        server.rate("day1/rate", json!({"img": "a.png", "rating": 4})).await.unwrap();
        let after_rating = server.get("day1", ListQuery::default(), conditional).await.unwrap();
        assert_eq!(after_rating.status(), StatusCode::OK);
        assert_ne!(after_rating.headers().get(header::ETAG).unwrap(), &etag);
    }

    #[tokio::test]
    async fn test_unknown_library_is_not_found() {
        let server = TestServer::new(&["day1/a.png"]);
        let err = server.get("nope", ListQuery::default(), HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reload_returns_fresh_tree() {
        let server = TestServer::new(&["day1/a.png"]);
        fs::create_dir_all(server.base().join("day2")).unwrap();
        fs::write(server.base().join("day2/b.jpg"), b"jpg").unwrap();

        let response = handlers::reload_libraries(State(server.state.clone())).await.unwrap();
        let body = body_json(response).await;
        let paths: Vec<&str> = body["folders"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["day1", "day2"]);
        assert!(server.state.library.folder("day2").is_some());
    }
}

#[cfg(test)]
mod rating_tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_rejects_bad_payloads() {
        let server = TestServer::new(&["day1/a.png"]);
        for body in [
            json!({"img": "a.png", "rating": 0}),
            json!({"img": "a.png", "rating": 6}),
            json!({"img": "a.png", "rating": "5"}),
            json!({"img": "a.png", "rating": 2.5}),
            json!({"img": "a.png"}),
            json!({"rating": 3}),
        ] {
            let err = server.rate("day1/rate", body.clone()).await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST, "payload {}", body);
        }
        assert_eq!(server.state.library.ratings().get_rating("day1", "a.png").unwrap(), None);
    }

    #[tokio::test]
    async fn test_rate_stores_rating() {
        let server = TestServer::new(&["day1/a.png"]);
        server.rate("day1/rate", json!({"img": "a.png", "rating": 2})).await.unwrap();
        assert_eq!(
            server.state.library.ratings().get_rating("day1", "a.png").unwrap(),
            Some(Rating::try_from(2u8).unwrap())
        );
    }

    #[tokio::test]
    async fn test_rate_unknown_route() {
        let server = TestServer::new(&["day1/a.png"]);
        let err = server.rate("nope/rate", json!({"img": "a.png", "rating": 2})).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = server.rate("day1/other", json!({"img": "a.png", "rating": 2})).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_image_bytes() {
        let server = TestServer::new(&["day1/raw.jpg"]);
        let response = server.get("day1/raw.jpg", ListQuery::default(), HeaderMap::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "image/jpeg");
        assert_eq!(body_bytes(response).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_serves_byte_ranges() {
        let server = TestServer::new(&["day1/raw.jpg"]);
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));

        let response = server.get("day1/raw.jpg", ListQuery::default(), headers).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers().get(header::CONTENT_RANGE).unwrap(), "bytes 2-5/10");
        assert_eq!(body_bytes(response).await, b"2345");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=-3"));
        let response = server.get("day1/raw.jpg", ListQuery::default(), headers).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, b"789");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=50-"));
        let err = server.get("day1/raw.jpg", ListQuery::default(), headers).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_missing_and_escaping_files() {
        let server = TestServer::new(&["day1/a.png", "secret.jpg"]);
        let err = server.get("day1/missing.png", ListQuery::default(), HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = server.get("day1/../secret.jpg", ListQuery::default(), HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metadata_endpoint() {
        let server = TestServer::new(&["day1/a.png"]);
        let response = server.get("day1/a.png/metadata", ListQuery::default(), HeaderMap::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["filename"], "a.png");
        assert_eq!(body["width"], 8);
        assert_eq!(body["height"], 4);
        assert_eq!(body["isPng"], true);

        let err = server.get("day1/gone.png/metadata", ListQuery::default(), HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_status_codes() {
        let server = TestServer::new(&["day1/x.png", "day1/y.png"]);
        server.rate("day1/rate", json!({"img": "x.png", "rating": 5})).await.unwrap();

        let delete = |library: Option<&str>, file: Option<&str>| {
            let request = DeleteRequest {
                library: library.map(str::to_string),
                file: file.map(str::to_string),
            };
            handlers::delete_file(State(server.state.clone()), Ok(Json(request)))
        };

        assert_eq!(delete(None, Some("x.png")).await.unwrap_err().status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(delete(Some("day1"), None).await.unwrap_err().status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(delete(Some("nope"), Some("x.png")).await.unwrap_err().status_code(), StatusCode::NOT_FOUND);
        assert_eq!(delete(Some("day1"), Some("zz.png")).await.unwrap_err().status_code(), StatusCode::NOT_FOUND);

        assert_eq!(delete(Some("day1"), Some("x.png")).await.unwrap(), StatusCode::OK);
        assert!(!server.base().join("day1/x.png").exists());
        assert_eq!(server.state.library.ratings().get_rating("day1", "x.png").unwrap(), None);

        let body = body_json(server.get("day1", ratings_query("5"), HeaderMap::new()).await.unwrap()).await;
        assert!(file_names(&body).is_empty());
    }
}

#[cfg(test)]
mod customization_tests {
    use super::*;

    fn request(folder_path: &str, display_name: Option<&str>, icon: Option<&str>) -> CustomizationRequest {
        CustomizationRequest {
            folder_path: Some(folder_path.to_string()),
            display_name: display_name.map(str::to_string),
            icon: icon.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_customization_crud() {
        let server = TestServer::new(&["day1/a.png"]);
        let state = || State(server.state.clone());

        let status = handlers::set_customization(state(), Ok(Json(request("2024/day1", Some("Day one"), Some("⭐")))))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);

        let body = body_json(handlers::get_customizations(state()).await.unwrap()).await;
        assert_eq!(body["2024/day1"]["displayName"], "Day one");
        assert_eq!(body["2024/day1"]["icon"], "⭐");

        handlers::remove_customization(state(), Path("2024/day1".to_string())).await.unwrap();
        let body = body_json(handlers::get_customizations(state()).await.unwrap()).await;
        assert!(body.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_customization_removes_entry() {
        let server = TestServer::new(&["day1/a.png"]);
        let state = || State(server.state.clone());

        handlers::set_customization(state(), Ok(Json(request("foo", Some("Foo"), None)))).await.unwrap();
        handlers::set_customization(state(), Ok(Json(request("foo", None, None)))).await.unwrap();
        let body = body_json(handlers::get_customizations(state()).await.unwrap()).await;
        assert!(body.get("foo").is_none());
    }

    #[tokio::test]
    async fn test_customization_requires_folder_path() {
        let server = TestServer::new(&["day1/a.png"]);
        let err = handlers::set_customization(
            State(server.state.clone()),
            Ok(Json(CustomizationRequest::default())),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}

#[cfg(test)]
mod long_poll_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_update_times_out() {
        let server = TestServer::new(&["day1/a.png"]);
        let started = tokio::time::Instant::now();

        let response = server.get("day1/wait-for-update", ListQuery::default(), HeaderMap::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(body_json(response).await, json!({"timeout": true, "changed": false}));
    }

    #[tokio::test]
    async fn test_version_tag() {
        let server = TestServer::new(&["day1/a.png"]);
        let response = handlers::version_tag_handler(State(server.state.clone()), Query(VersionQuery::default()))
            .await
            .into_response();
        assert_eq!(body_bytes(response).await, b"test-tag");
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_tag_long_poll_is_delayed() {
        let server = TestServer::new(&["day1/a.png"]);
        let started = tokio::time::Instant::now();
        let query = VersionQuery {
            longpoll: Some("true".to_string()),
        };
        let response = handlers::version_tag_handler(State(server.state.clone()), Query(query))
            .await
            .into_response();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(body_bytes(response).await, b"test-tag");
    }
}
