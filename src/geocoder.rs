use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::diagnostics::DiagnosticSink;
use crate::errors::{AppError, AppResult};
use crate::geo::{Coordinate, Viewbox};
use crate::lexicon::Lexicon;

const SEARCH_LIMIT: usize = 10;
const ADMIN_FALLBACK_LIMIT: usize = 5;
const MIN_REQUEST_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub viewbox: Option<Viewbox>,
    pub limit: usize,
    pub bounded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub coordinate: Coordinate,
    pub display_name: Option<String>,
}

#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> AppResult<Vec<GeocodeHit>>;
}

pub struct NominatimClient {
    http: Client,
    base_url: String,
    rate_limiter: RateLimiter,
}

impl NominatimClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.http_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.geocoder_base_url.trim_end_matches('/').to_string(),
            rate_limiter: RateLimiter::new(config.geocoder_rate_limit_qps),
        })
    }
}

#[async_trait]
impl GeocodeLookup for NominatimClient {
    async fn search(&self, request: &SearchRequest) -> AppResult<Vec<GeocodeHit>> {
        let mut params = vec![
            ("q", request.query.clone()),
            ("format", "json".to_string()),
            ("limit", request.limit.max(1).to_string()),
        ];
        if let Some(viewbox) = &request.viewbox {
            params.push(("viewbox", viewbox.to_query_value()));
            if request.bounded {
                params.push(("bounded", "1".to_string()));
            }
        }

        self.rate_limiter.wait().await;
        let response = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&params)
            .send()
            .await?
            .error_for_status()?;

        let entries: Vec<Value> = match response.json::<Value>().await? {
            Value::Array(entries) => entries,
            Value::Null => Vec::new(),
            other => {
                return Err(AppError::Geocoder(format!(
                    "unexpected search response: {}",
                    truncate_for_log(&other.to_string())
                )))
            }
        };

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let hit = parse_hit(entry);
                if hit.is_none() {
                    debug!(entry = %truncate_for_log(&entry.to_string()), "skipping malformed geocoder entry");
                }
                hit
            })
            .collect())
    }
}

fn parse_hit(entry: &Value) -> Option<GeocodeHit> {
    let lat = coordinate_component(entry.get("lat")?)?;
    let lon = coordinate_component(entry.get("lon")?)?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some(GeocodeHit {
        coordinate: Coordinate::new(lat, lon),
        display_name: entry
            .get("display_name")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn coordinate_component(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn truncate_for_log(text: &str) -> String {
    text.chars().take(200).collect()
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(MIN_REQUEST_INTERVAL_MS)
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    Bounded,
    AdministrativeFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub query: String,
    pub coordinate: Coordinate,
    pub distance_km: Option<f64>,
    pub path: ResolutionPath,
}

pub struct BoundedGeocoder {
    lookup: Arc<dyn GeocodeLookup>,
    lexicon: Arc<Lexicon>,
    city_name: String,
    default_center: Coordinate,
    max_distance_km: f64,
    center: OnceCell<Coordinate>,
    diagnostics: DiagnosticSink,
}

impl BoundedGeocoder {
    pub fn new(
        lookup: Arc<dyn GeocodeLookup>,
        lexicon: Arc<Lexicon>,
        config: &AppConfig,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            lookup,
            lexicon,
            city_name: config.city_name.clone(),
            default_center: config.default_center,
            max_distance_km: config.max_distance_km,
            center: OnceCell::new(),
            diagnostics,
        }
    }

    pub async fn center(&self) -> Coordinate {
        *self
            .center
            .get_or_init(|| self.lookup_center())
            .await
    }

    pub fn reset_center_cache(&mut self) {
        self.center = OnceCell::new();
    }

    async fn lookup_center(&self) -> Coordinate {
        let request = SearchRequest {
            query: self.city_name.clone(),
            viewbox: None,
            limit: 1,
            bounded: false,
        };
        match self.lookup.search(&request).await {
            Ok(hits) => match hits.into_iter().next() {
                Some(hit) => {
                    info!(
                        city = %self.city_name,
                        display_name = hit.display_name.as_deref().unwrap_or_default(),
                        lat = hit.coordinate.lat,
                        lon = hit.coordinate.lon,
                        "resolved city center"
                    );
                    hit.coordinate
                }
                None => {
                    warn!(city = %self.city_name, "city not found; using default center");
                    self.default_center
                }
            },
            Err(err) => {
                warn!(?err, city = %self.city_name, "city lookup failed; using default center");
                self.diagnostics.emit(
                    "center_lookup_failed",
                    json!({ "city": self.city_name, "reason": err.to_string() }),
                );
                self.default_center
            }
        }
    }

    // The first query with any in-radius hit wins with its closest hit; later
    // queries are not consulted even if they would land closer.
    pub async fn resolve(&self, queries: &[String]) -> Option<Resolution> {
        let center = self.center().await;
        let viewbox = Viewbox::around(center, self.max_distance_km);

        let mut best: Option<Resolution> = None;
        for query in queries {
            let request = SearchRequest {
                query: query.clone(),
                viewbox: Some(viewbox),
                limit: SEARCH_LIMIT,
                bounded: true,
            };
            let hits = self.search_or_empty(&request).await;
            debug!(query = %query, hits = hits.len(), "geocoder answered");

            for hit in hits {
                let distance = center.distance_km(&hit.coordinate);
                if distance > self.max_distance_km {
                    continue;
                }
                let closer = best
                    .as_ref()
                    .and_then(|current| current.distance_km)
                    .map_or(true, |current| distance < current);
                if closer {
                    best = Some(Resolution {
                        query: query.clone(),
                        coordinate: hit.coordinate,
                        distance_km: Some(distance),
                        path: ResolutionPath::Bounded,
                    });
                }
            }

            if best.is_some() {
                return best;
            }
        }

        let admin_query = queries.iter().find(|q| self.lexicon.mentions_admin(q))?;
        let request = SearchRequest {
            query: self.lexicon.admin_fallback_query(&self.city_name),
            viewbox: Some(viewbox),
            limit: ADMIN_FALLBACK_LIMIT,
            bounded: true,
        };
        let hit = self.search_or_empty(&request).await.into_iter().next()?;
        info!(
            query = %admin_query,
            fallback = %request.query,
            "accepted administrative fallback"
        );
        Some(Resolution {
            query: admin_query.clone(),
            coordinate: hit.coordinate,
            distance_km: None,
            path: ResolutionPath::AdministrativeFallback,
        })
    }

    async fn search_or_empty(&self, request: &SearchRequest) -> Vec<GeocodeHit> {
        match self.lookup.search(request).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(?err, query = %request.query, "geocoder query failed");
                self.diagnostics.emit(
                    "geocode_query_failed",
                    json!({ "query": request.query, "reason": err.to_string() }),
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::config::test_config;
    use crate::geo::EARTH_RADIUS_KM;

    const CENTER: Coordinate = Coordinate {
        lat: 55.9386,
        lon: 37.5126,
    };

    #[derive(Default)]
    struct FakeLookup {
        answers: HashMap<String, AppResult<Vec<GeocodeHit>>>,
        requests: Mutex<Vec<SearchRequest>>,
        center_calls: AtomicUsize,
    }

    impl FakeLookup {
        fn with_city() -> Self {
            let mut fake = Self::default();
            fake.answer("Долгопрудный", vec![CENTER]);
            fake
        }

        fn answer(&mut self, query: &str, points: Vec<Coordinate>) {
            let hits = points
                .into_iter()
                .map(|coordinate| GeocodeHit {
                    coordinate,
                    display_name: None,
                })
                .collect();
            self.answers.insert(query.to_string(), Ok(hits));
        }

        fn fail(&mut self, query: &str) {
            self.answers.insert(
                query.to_string(),
                Err(AppError::Geocoder("timed out".into())),
            );
        }

        fn queries(&self) -> Vec<String> {
            self.requests.lock().iter().map(|r| r.query.clone()).collect()
        }
    }

    #[async_trait]
    impl GeocodeLookup for FakeLookup {
        async fn search(&self, request: &SearchRequest) -> AppResult<Vec<GeocodeHit>> {
            if request.viewbox.is_none() {
                self.center_calls.fetch_add(1, Ordering::SeqCst);
            }
            self.requests.lock().push(request.clone());
            match self.answers.get(&request.query) {
                Some(Ok(hits)) => Ok(hits.clone()),
                Some(Err(_)) => Err(AppError::Geocoder("timed out".into())),
                None => Ok(Vec::new()),
            }
        }
    }

    fn geocoder(fake: Arc<FakeLookup>) -> BoundedGeocoder {
        let dir = std::env::temp_dir();
        BoundedGeocoder::new(
            fake,
            Arc::new(Lexicon::default()),
            &test_config(&dir),
            DiagnosticSink::disabled(),
        )
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn north_of_center(km: f64) -> Coordinate {
        Coordinate::new(CENTER.lat + (km / EARTH_RADIUS_KM).to_degrees(), CENTER.lon)
    }

    #[tokio::test]
    async fn center_is_looked_up_once() {
        let fake = Arc::new(FakeLookup::with_city());
        let geocoder = geocoder(fake.clone());
        assert_eq!(geocoder.center().await, CENTER);
        assert_eq!(geocoder.center().await, CENTER);
        assert_eq!(fake.center_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn center_falls_back_to_default() {
        let mut fake = FakeLookup::default();
        fake.fail("Долгопрудный");
        let geocoder = geocoder(Arc::new(fake));
        assert_eq!(geocoder.center().await, Coordinate::new(55.7558, 37.6173));
    }

    #[tokio::test]
    async fn unknown_city_uses_default_center() {
        let fake = Arc::new(FakeLookup::default());
        let geocoder = geocoder(fake.clone());
        assert_eq!(geocoder.center().await, Coordinate::new(55.7558, 37.6173));
        assert_eq!(fake.center_calls.load(Ordering::SeqCst), 1);

        let resolution = geocoder.resolve(&strings(&["балково"])).await;
        assert!(resolution.is_none());
        assert_eq!(fake.center_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_forces_new_center_lookup() {
        let fake = Arc::new(FakeLookup::with_city());
        let mut geocoder = geocoder(fake.clone());
        geocoder.center().await;
        geocoder.reset_center_cache();
        geocoder.center().await;
        assert_eq!(fake.center_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_query_with_hit_wins() {
        let mut fake = FakeLookup::with_city();
        fake.answer("магнит, лобня", vec![north_of_center(10.0)]);
        // Closer, but only reachable through a later, more general query.
        fake.answer("магнит", vec![north_of_center(1.0)]);
        let fake = Arc::new(fake);
        let geocoder = geocoder(fake.clone());

        let resolution = geocoder
            .resolve(&strings(&["магнит, лобня, МО", "магнит, лобня", "магнит"]))
            .await
            .unwrap();
        assert_eq!(resolution.query, "магнит, лобня");
        assert_eq!(resolution.path, ResolutionPath::Bounded);
        assert!((resolution.distance_km.unwrap() - 10.0).abs() < 0.01);
        assert!(!fake.queries().contains(&"магнит".to_string()));
    }

    #[tokio::test]
    async fn picks_closest_in_radius_candidate_of_winning_query() {
        let mut fake = FakeLookup::with_city();
        fake.answer(
            "балково",
            vec![north_of_center(40.0), north_of_center(7.0), north_of_center(3.0)],
        );
        let geocoder = geocoder(Arc::new(fake));
        let resolution = geocoder.resolve(&strings(&["балково"])).await.unwrap();
        assert!((resolution.distance_km.unwrap() - 3.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn rejects_candidates_beyond_radius() {
        let mut fake = FakeLookup::with_city();
        fake.answer("балково", vec![north_of_center(25.5)]);
        let geocoder = geocoder(Arc::new(fake));
        assert!(geocoder.resolve(&strings(&["балково"])).await.is_none());
    }

    #[tokio::test]
    async fn accepts_candidate_exactly_at_radius() {
        let edge = north_of_center(25.0);
        let mut fake = FakeLookup::with_city();
        fake.answer("балково", vec![edge]);
        let fake = Arc::new(fake);
        let mut geocoder = geocoder(fake);
        geocoder.max_distance_km = CENTER.distance_km(&edge);

        let resolution = geocoder.resolve(&strings(&["балково"])).await.unwrap();
        assert_eq!(resolution.coordinate, edge);
    }

    #[tokio::test]
    async fn failing_query_does_not_abort_the_loop() {
        let mut fake = FakeLookup::with_city();
        fake.fail("балково, МО");
        fake.answer("балково", vec![north_of_center(2.0)]);
        let geocoder = geocoder(Arc::new(fake));
        let resolution = geocoder
            .resolve(&strings(&["балково, МО", "балково"]))
            .await
            .unwrap();
        assert_eq!(resolution.query, "балково");
    }

    #[tokio::test]
    async fn searches_are_bounded_to_the_viewbox() {
        let mut fake = FakeLookup::with_city();
        fake.answer("балково", vec![north_of_center(2.0)]);
        let fake = Arc::new(fake);
        let geocoder = geocoder(fake.clone());
        geocoder.resolve(&strings(&["балково"])).await.unwrap();

        let requests = fake.requests.lock().clone();
        let search = requests.iter().find(|r| r.query == "балково").unwrap();
        assert!(search.bounded);
        assert_eq!(search.limit, SEARCH_LIMIT);
        assert_eq!(search.viewbox, Some(Viewbox::around(CENTER, 25.0)));
    }

    #[tokio::test]
    async fn administrative_fallback_is_not_distance_checked() {
        let far_away = north_of_center(300.0);
        let mut fake = FakeLookup::with_city();
        fake.answer("Администрация Долгопрудный", vec![far_away]);
        let geocoder = geocoder(Arc::new(fake));

        let resolution = geocoder
            .resolve(&strings(&["у администрации, МО", "у администрации"]))
            .await
            .unwrap();
        assert_eq!(resolution.path, ResolutionPath::AdministrativeFallback);
        assert_eq!(resolution.query, "у администрации, МО");
        assert_eq!(resolution.coordinate, far_away);
        assert_eq!(resolution.distance_km, None);
    }

    #[tokio::test]
    async fn no_fallback_without_admin_keywords() {
        let mut fake = FakeLookup::with_city();
        fake.answer("Администрация Долгопрудный", vec![north_of_center(1.0)]);
        let fake = Arc::new(fake);
        let geocoder = geocoder(fake.clone());
        assert!(geocoder.resolve(&strings(&["балково"])).await.is_none());
        assert!(!fake
            .queries()
            .contains(&"Администрация Долгопрудный".to_string()));
    }

    #[test]
    fn parses_string_and_numeric_coordinates() {
        let hit = parse_hit(&json!({"lat": "55.9", "lon": 37.5, "display_name": "X"})).unwrap();
        assert_eq!(hit.coordinate, Coordinate::new(55.9, 37.5));
        assert_eq!(hit.display_name.as_deref(), Some("X"));
        assert!(parse_hit(&json!({"lat": "north", "lon": "37.5"})).is_none());
        assert!(parse_hit(&json!({"lon": "37.5"})).is_none());
        assert!(parse_hit(&json!({"lat": 95.0, "lon": 37.5})).is_none());
    }

    #[test]
    fn rate_limiter_interval_has_floor() {
        assert_eq!(RateLimiter::interval_ms(1), 1000);
        assert_eq!(RateLimiter::interval_ms(1000), MIN_REQUEST_INTERVAL_MS);
    }
}
