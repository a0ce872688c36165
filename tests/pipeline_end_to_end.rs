use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::{tempdir, TempDir};

use chatmap::commands;
use chatmap::config::AppConfig;
use chatmap::geocoder::ResolutionPath;
use chatmap::{AppState, Outcome, SkipReason};

const CITY: &str = "Долгопрудный";
const REGION: &str = "Московская область";

fn config(dir: &TempDir, server: &Server) -> AppConfig {
    AppConfig {
        city_name: CITY.into(),
        region_hint: REGION.into(),
        geocoder_base_url: server.url_str(""),
        geocoder_rate_limit_qps: 20,
        http_timeout_secs: 5,
        model_base_url: server.url_str("/v1"),
        data_dir: dir.path().to_path_buf(),
        database_file_name: "e2e.db".into(),
        commit_base_delay_ms: 1,
        diagnostics_batch_size: 1,
        ..AppConfig::default()
    }
}

fn expect_center(server: &Server) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", CITY)))),
        ])
        .times(1)
        .respond_with(json_encoded(json!([
            { "lat": "55.9386", "lon": "37.5126", "display_name": CITY }
        ]))),
    );
}

fn expect_search(server: &Server, query: &'static str, times: usize, body: serde_json::Value) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", query)))),
            request::query(url_decoded(contains(("bounded", "1")))),
        ])
        .times(times)
        .respond_with(json_encoded(body)),
    );
}

#[tokio::test]
async fn area_message_is_geocoded_and_confirmed_on_repeat() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    expect_center(&server);
    expect_search(
        &server,
        "балково, Московская область",
        2,
        json!([{ "lat": "55.9561", "lon": "37.5402", "display_name": "Балково" }]),
    );

    let state = AppState::initialize(config(&dir, &server)).unwrap();
    let pipeline = state.pipeline();

    let first = pipeline
        .handle_message("стоит у балково", chrono::Utc::now())
        .await
        .unwrap();
    let Outcome::Inserted { place, resolution } = first else {
        panic!("expected insert, got {first:?}");
    };
    assert_eq!(place.name, "балково, Московская область");
    assert_eq!(place.confirmations, 1);
    assert_eq!(resolution.path, ResolutionPath::Bounded);
    assert!(resolution.distance_km.unwrap() <= state.config().max_distance_km);

    let second = pipeline
        .handle_message("стоит у балково", chrono::Utc::now())
        .await
        .unwrap();
    let Outcome::Updated { place: updated, .. } = second else {
        panic!("expected update, got {second:?}");
    };
    assert_eq!(updated.id, place.id);
    assert_eq!(updated.confirmations, 2);
    assert!(updated.last_seen_at >= place.last_seen_at);

    let places = commands::list_places(&state).unwrap();
    assert_eq!(places.len(), 1);
}

#[tokio::test]
async fn administration_message_uses_city_hall_fallback() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    expect_center(&server);
    expect_search(&server, "администрации, Московская область", 1, json!([]));
    expect_search(&server, "администрации", 1, json!([]));
    // Far outside the radius; the fallback is not distance-checked.
    expect_search(
        &server,
        "Администрация Долгопрудный",
        1,
        json!([
            { "lat": 56.9, "lon": 37.5, "display_name": "Администрация" },
            { "lat": 55.0, "lon": 37.0 }
        ]),
    );

    let state = AppState::initialize(config(&dir, &server)).unwrap();
    let outcome = state
        .pipeline()
        .handle_message("стоят у администрации", chrono::Utc::now())
        .await
        .unwrap();

    let Outcome::Inserted { place, resolution } = outcome else {
        panic!("expected insert, got {outcome:?}");
    };
    assert_eq!(resolution.path, ResolutionPath::AdministrativeFallback);
    assert_eq!(place.name, "администрации, Московская область");
    assert_eq!((place.lat, place.lon), (56.9, 37.5));
}

#[tokio::test]
async fn unresolvable_message_leaves_store_untouched() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    expect_center(&server);
    expect_search(&server, "балково, Московская область", 1, json!([]));
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "балково")))),
        ])
        .times(1)
        .respond_with(status_code(503)),
    );

    let state = AppState::initialize(config(&dir, &server)).unwrap();
    let outcome = state
        .pipeline()
        .handle_message("стоит у балково", chrono::Utc::now())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::Skipped {
            reason: SkipReason::NothingGeocoded
        }
    );
    assert!(commands::list_places(&state).unwrap().is_empty());
    let diagnostics = std::fs::read_to_string(state.diagnostics().buffer_path()).unwrap();
    assert!(diagnostics.contains("geocode_query_failed"));
}

#[tokio::test]
async fn model_candidates_drive_the_queries() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", "/v1/chat/completions"),
            request::headers(contains(("authorization", "Bearer test-key"))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({
            "choices": [{
                "message": {
                    "content": "```json\n{\"objects\": [\"магнит\"], \"areas\": [\"лобня\"]}\n```"
                }
            }]
        }))),
    );
    expect_center(&server);
    expect_search(
        &server,
        "магнит, лобня, Московская область",
        1,
        json!([{ "lat": "56.0110", "lon": "37.4810" }]),
    );

    let mut config = config(&dir, &server);
    config.model_api_key = Some(SecretString::from("test-key".to_string()));
    let state = AppState::initialize(config).unwrap();

    let outcome = state
        .pipeline()
        .handle_message("в лобне у магнита пусто", chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(
        outcome.place().map(|p| p.name.as_str()),
        Some("магнит, лобня, Московская область")
    );
}

#[tokio::test]
async fn failing_model_falls_back_to_heuristic() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
            .times(1)
            .respond_with(status_code(500)),
    );
    expect_center(&server);
    expect_search(
        &server,
        "балково, Московская область",
        1,
        json!([{ "lat": "55.9561", "lon": "37.5402" }]),
    );

    let mut config = config(&dir, &server);
    config.model_api_key = Some(SecretString::from("test-key".to_string()));
    let state = AppState::initialize(config).unwrap();

    let outcome = state
        .pipeline()
        .handle_message("стоит у балково", chrono::Utc::now())
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Inserted { .. }));

    let diagnostics = std::fs::read_to_string(state.diagnostics().buffer_path()).unwrap();
    assert!(diagnostics.contains("extractor_fallback"));
    assert!(diagnostics.contains("place_merged"));
}

#[tokio::test]
async fn admin_commands_delete_and_report() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    expect_center(&server);
    expect_search(
        &server,
        "балково, Московская область",
        1,
        json!([{ "lat": "55.9561", "lon": "37.5402" }]),
    );

    let state = AppState::initialize(config(&dir, &server)).unwrap();
    let outcome = state
        .pipeline()
        .handle_message("стоит у балково", chrono::Utc::now())
        .await
        .unwrap();
    let id = outcome.place().unwrap().id;

    let status = commands::status(&state).unwrap();
    assert_eq!(status.place_count, 1);
    assert!(!status.config.has_model_key);

    assert_eq!(commands::sweep_now(&state).await.unwrap().deleted, 0);
    assert!(commands::delete_place(&state, id).await.unwrap().deleted);
    assert!(!commands::delete_place(&state, id).await.unwrap().deleted);
    assert_eq!(commands::clear_places(&state).await.unwrap().deleted, 0);
}
