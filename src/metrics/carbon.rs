// Carbon intensity collectors
//
// Polls an Electricity Maps compatible API for the grid carbon intensity at
// each registered location. Two gauges are produced:
// - the latest measured intensity (one sample per location)
// - the forecast (one sample per forecast horizon per location)

use async_trait::async_trait;
use chrono::Local;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{CollectionError, MetricCollector, MetricDescriptor, Sample};
use crate::target::{Target, TargetKind};

const LIVE_GAUGE: MetricDescriptor = MetricDescriptor {
    name: "node.fluidos.carbon",
    description: "Current carbon intensity",
    unit: "gCO2/kWh",
};

const FORECAST_GAUGE: MetricDescriptor = MetricDescriptor {
    name: "node.fluidos.carbon_forecast",
    description: "Forecasted carbon intensity",
    unit: "gCO2/kWh",
};

/// Capture timestamp attached to forecast samples
const FORECAST_DATE_FORMAT: &str = "%m/%d/%Y-%H:%M";

/// Source of carbon intensity values for a coordinate pair
#[async_trait]
pub trait CarbonProvider: Send + Sync {
    /// Latest carbon intensity in gCO2eq/kWh
    async fn latest(&self, lat: &str, lon: &str) -> Result<f64, CollectionError>;

    /// Forecasted carbon intensity, ordered by horizon
    async fn forecast(&self, lat: &str, lon: &str) -> Result<Vec<f64>, CollectionError>;
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(rename = "carbonIntensity")]
    carbon_intensity: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    forecast: Vec<ForecastPoint>,
}

#[derive(Debug, Deserialize)]
struct ForecastPoint {
    #[serde(rename = "carbonIntensity")]
    carbon_intensity: f64,
}

/// HTTP client for the carbon intensity API
///
/// Authenticates with the `auth-token` header. Any response other than
/// `200 OK` is reported as `CollectionError::Status`.
pub struct ElectricityMapsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ElectricityMapsClient {
    /// Creates a client whose requests are bounded by `timeout`
    ///
    /// # Arguments
    /// * `base_url` - API root, e.g. "https://api.electricitymap.org/v3"
    /// * `api_key` - Value sent in the `auth-token` header
    /// * `timeout` - Upper bound for each request, connect included
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, CollectionError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, api_key))
    }

    pub fn with_client(client: Client, base_url: &str, api_key: &str) -> Self {
        ElectricityMapsClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn get<T>(&self, path: &str, lat: &str, lon: &str) -> Result<T, CollectionError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.base_url, path);
        debug!("Request URL: {} (lat={}, lon={})", url, lat, lon);

        let response = self
            .client
            .get(&url)
            .header("auth-token", &self.api_key)
            .query(&[("lat", lat), ("lon", lon)])
            .send()
            .await?;

        let status = response.status();
        debug!("Response status code: {}", status);

        if status != StatusCode::OK {
            return Err(CollectionError::Status(status.as_u16()));
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl CarbonProvider for ElectricityMapsClient {
    async fn latest(&self, lat: &str, lon: &str) -> Result<f64, CollectionError> {
        let body: LatestResponse = self.get("carbon-intensity/latest", lat, lon).await?;
        Ok(body.carbon_intensity)
    }

    async fn forecast(&self, lat: &str, lon: &str) -> Result<Vec<f64>, CollectionError> {
        let body: ForecastResponse = self.get("carbon-intensity/forecast", lat, lon).await?;
        Ok(body
            .forecast
            .into_iter()
            .map(|point| point.carbon_intensity)
            .collect())
    }
}

/// Latest carbon intensity, one sample per location
pub struct LiveCarbonCollector {
    provider: Arc<dyn CarbonProvider>,
}

impl LiveCarbonCollector {
    pub fn new(provider: Arc<dyn CarbonProvider>) -> Self {
        LiveCarbonCollector { provider }
    }
}

#[async_trait]
impl MetricCollector for LiveCarbonCollector {
    fn name(&self) -> &str {
        "carbon_live"
    }

    fn accepts(&self, kind: TargetKind) -> bool {
        kind == TargetKind::Geo
    }

    async fn collect(&self, target: &Target) -> Result<Vec<Sample>, CollectionError> {
        let Target::Geo(geo) = target else {
            return Err(CollectionError::unsupported(self.name(), target));
        };

        let carbon = self.provider.latest(&geo.lat, &geo.lon).await?;
        debug!("Carbon intensity at {}/{}: {}", geo.lat, geo.lon, carbon);

        Ok(vec![LIVE_GAUGE.sample(carbon, target.attributes())])
    }
}

/// Carbon intensity forecast, one sample per horizon index
///
/// Every sample of a location carries the same `date` attribute (the capture
/// time) and a distinct `forecast` attribute holding the horizon index.
pub struct ForecastCarbonCollector {
    provider: Arc<dyn CarbonProvider>,
}

impl ForecastCarbonCollector {
    pub fn new(provider: Arc<dyn CarbonProvider>) -> Self {
        ForecastCarbonCollector { provider }
    }
}

#[async_trait]
impl MetricCollector for ForecastCarbonCollector {
    fn name(&self) -> &str {
        "carbon_forecast"
    }

    fn accepts(&self, kind: TargetKind) -> bool {
        kind == TargetKind::Geo
    }

    async fn collect(&self, target: &Target) -> Result<Vec<Sample>, CollectionError> {
        let Target::Geo(geo) = target else {
            return Err(CollectionError::unsupported(self.name(), target));
        };

        let forecast = self.provider.forecast(&geo.lat, &geo.lon).await?;
        let date = Local::now().format(FORECAST_DATE_FORMAT).to_string();

        let mut base = target.attributes();
        base.insert("date".to_string(), date);

        Ok(forecast
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let mut attributes = base.clone();
                attributes.insert("forecast".to_string(), index.to_string());
                FORECAST_GAUGE.sample(value, attributes)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::{HashMap, HashSet};
    use tokio::net::TcpListener;

    struct StubProvider {
        forecast: Option<Vec<f64>>,
    }

    #[async_trait]
    impl CarbonProvider for StubProvider {
        async fn latest(&self, _lat: &str, _lon: &str) -> Result<f64, CollectionError> {
            match &self.forecast {
                Some(values) => Ok(values[0]),
                None => Err(CollectionError::Status(503)),
            }
        }

        async fn forecast(&self, _lat: &str, _lon: &str) -> Result<Vec<f64>, CollectionError> {
            self.forecast.clone().ok_or(CollectionError::Status(503))
        }
    }

    fn paris() -> Target {
        Target::geo("48.864716", "2.349014")
    }

    #[tokio::test]
    async fn test_forecast_expands_per_horizon() {
        let provider = Arc::new(StubProvider {
            forecast: Some(vec![120.0, 95.5, 101.0]),
        });
        let collector = ForecastCarbonCollector::new(provider);

        let samples = collector.collect(&paris()).await.unwrap();
        assert_eq!(samples.len(), 3);

        let indexes: HashSet<&str> = samples
            .iter()
            .map(|s| s.attributes["forecast"].as_str())
            .collect();
        assert_eq!(indexes, HashSet::from(["0", "1", "2"]));

        for sample in &samples {
            assert_eq!(sample.name, "node.fluidos.carbon_forecast");
            assert_eq!(sample.attributes["latitude"], "48.864716");
            assert_eq!(sample.attributes["longitude"], "2.349014");
            assert_eq!(sample.attributes["date"], samples[0].attributes["date"]);
        }
        assert_eq!(samples[1].value, 95.5);
    }

    #[tokio::test]
    async fn test_live_emits_single_sample() {
        let provider = Arc::new(StubProvider {
            forecast: Some(vec![120.0, 95.5]),
        });

        let samples = LiveCarbonCollector::new(provider)
            .collect(&paris())
            .await
            .unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "node.fluidos.carbon");
        assert_eq!(samples[0].unit, "gCO2/kWh");
        assert_eq!(samples[0].value, 120.0);
        assert_eq!(samples[0].attributes["latitude"], "48.864716");
        assert_eq!(samples[0].attributes["longitude"], "2.349014");
        assert!(!samples[0].attributes.contains_key("forecast"));
    }

    #[tokio::test]
    async fn test_provider_failure_yields_error() {
        let provider: Arc<dyn CarbonProvider> = Arc::new(StubProvider { forecast: None });

        assert!(LiveCarbonCollector::new(Arc::clone(&provider))
            .collect(&paris())
            .await
            .is_err());
        assert!(ForecastCarbonCollector::new(provider)
            .collect(&paris())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rejects_peer_targets() {
        let provider = Arc::new(StubProvider {
            forecast: Some(vec![1.0]),
        });
        let result = LiveCarbonCollector::new(provider)
            .collect(&Target::peer("10.0.0.1"))
            .await;
        assert!(matches!(
            result,
            Err(CollectionError::UnsupportedTarget { .. })
        ));
    }

    async fn latest_handler(
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<Value>, axum::http::StatusCode> {
        if headers.get("auth-token").and_then(|v| v.to_str().ok()) != Some("secret") {
            return Err(axum::http::StatusCode::UNAUTHORIZED);
        }
        if params.get("lat").map(String::as_str) == Some("0.0") {
            return Err(axum::http::StatusCode::NOT_FOUND);
        }
        Ok(Json(json!({"zone": "FR", "carbonIntensity": 42.0})))
    }

    async fn forecast_handler() -> Json<Value> {
        Json(json!({
            "zone": "FR",
            "forecast": [
                {"carbonIntensity": 40.0, "datetime": "2024-01-15T10:00:00.000Z"},
                {"carbonIntensity": 41.0, "datetime": "2024-01-15T11:00:00.000Z"},
                {"carbonIntensity": 39.0, "datetime": "2024-01-15T12:00:00.000Z"}
            ]
        }))
    }

    async fn spawn_provider() -> String {
        let app = Router::new()
            .route("/v3/carbon-intensity/latest", get(latest_handler))
            .route("/v3/carbon-intensity/forecast", get(forecast_handler));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}/v3/", addr)
    }

    fn test_client(base_url: &str, api_key: &str) -> ElectricityMapsClient {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        ElectricityMapsClient::with_client(client, base_url, api_key)
    }

    #[tokio::test]
    async fn test_http_client_against_mock_provider() {
        let base_url = spawn_provider().await;
        let client = test_client(&base_url, "secret");

        assert_eq!(client.latest("48.86", "2.35").await.unwrap(), 42.0);
        assert_eq!(
            client.forecast("48.86", "2.35").await.unwrap(),
            vec![40.0, 41.0, 39.0]
        );

        assert!(matches!(
            client.latest("0.0", "0.0").await,
            Err(CollectionError::Status(404))
        ));
    }

    #[tokio::test]
    async fn test_http_client_bad_token() {
        let base_url = spawn_provider().await;
        let client = test_client(&base_url, "wrong");

        assert!(matches!(
            client.latest("48.86", "2.35").await,
            Err(CollectionError::Status(401))
        ));
    }
}
