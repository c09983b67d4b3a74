//! Distance and geocoding providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{Coordinate, TravelMode};
use crate::error::ProviderError;

use super::GeocodeResult;

/// Provider selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Offline estimate from beeline distance, no geocoding.
    #[default]
    Haversine,
    /// Google-compatible Distance Matrix and Geocoding endpoints.
    Http {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    5
}

impl ProviderConfig {
    /// Builds the configured provider. `road_factor` scales beeline distances.
    pub fn build(&self, road_factor: f64) -> Result<Arc<dyn DistanceProvider>, ProviderError> {
        match self {
            ProviderConfig::Haversine => Ok(Arc::new(HaversineProvider::new(road_factor))),
            ProviderConfig::Http {
                base_url,
                api_key,
                timeout_secs,
            } => Ok(Arc::new(HttpDistanceProvider::new(
                base_url,
                api_key.clone(),
                Duration::from_secs(*timeout_secs),
            )?)),
        }
    }
}

/// A distance as returned by a provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderDistance {
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

/// External distance and geocoding service.
///
/// Consulted only on cache misses; see [`super::DistanceService`].
#[async_trait]
pub trait DistanceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn distance(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> Result<ProviderDistance, ProviderError>;

    async fn geocode(&self, address: &str) -> Result<GeocodeResult, ProviderError>;

    /// False when [`DistanceProvider::geocode`] can never succeed.
    fn can_geocode(&self) -> bool {
        true
    }
}

/// Beeline distance scaled by a road factor, timed at the mode's average speed.
///
/// ```
/// use courier_dispatch::distance::provider::HaversineProvider;
/// use courier_dispatch::domain::{Coordinate, TravelMode};
///
/// let provider = HaversineProvider::new(1.0);
/// let d = provider.estimate(Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 1.0), TravelMode::Walking);
/// assert!((d.distance_meters - 111_195.0).abs() < 100.0);
/// // 5 km/h walking
/// assert!((d.duration_seconds / 3600.0 - 22.24).abs() < 0.05);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct HaversineProvider {
    road_factor: f64,
}

impl HaversineProvider {
    pub fn new(road_factor: f64) -> Self {
        Self { road_factor }
    }

    pub fn estimate(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> ProviderDistance {
        let km = origin.distance_km(&destination) * self.road_factor;
        ProviderDistance {
            distance_meters: km * 1000.0,
            duration_seconds: km / mode.average_speed_kmph() * 3600.0,
        }
    }
}

#[async_trait]
impl DistanceProvider for HaversineProvider {
    fn name(&self) -> &'static str {
        "haversine"
    }

    async fn distance(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> Result<ProviderDistance, ProviderError> {
        Ok(self.estimate(origin, destination, mode))
    }

    async fn geocode(&self, _address: &str) -> Result<GeocodeResult, ProviderError> {
        Err(ProviderError::Unsupported("haversine"))
    }

    fn can_geocode(&self) -> bool {
        false
    }
}

/// Client for a Google-compatible maps API.
///
/// Requests `{base_url}/distancematrix/json` and `{base_url}/geocode/json`.
pub struct HttpDistanceProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDistanceProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(concat!("courier-dispatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{}/json", self.base_url, endpoint);
        let mut request = self.client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            warn!(endpoint, status = %response.status(), "Distance provider returned an error status");
            return Err(ProviderError::Status(response.status().to_string()));
        }
        Ok(response.json().await?)
    }
}

/// Maps a travel mode onto the provider's mode parameter.
///
/// Scooters use driving directions without highways.
fn mode_params(mode: TravelMode) -> Vec<(&'static str, String)> {
    match mode {
        TravelMode::Scooter => vec![
            ("mode", "driving".to_string()),
            ("avoid", "highways".to_string()),
        ],
        other => vec![("mode", other.as_str().to_string())],
    }
}

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    status: String,
    #[serde(default)]
    rows: Vec<MatrixRow>,
}

#[derive(Debug, Deserialize)]
struct MatrixRow {
    elements: Vec<MatrixElement>,
}

#[derive(Debug, Deserialize)]
struct MatrixElement {
    status: String,
    distance: Option<ValueField>,
    duration: Option<ValueField>,
}

#[derive(Debug, Deserialize)]
struct ValueField {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeocodeCandidate {
    formatted_address: String,
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: Coordinate,
}

fn matrix_distance(response: MatrixResponse) -> Result<ProviderDistance, ProviderError> {
    if response.status != "OK" {
        return Err(ProviderError::Status(response.status));
    }
    let element = response
        .rows
        .into_iter()
        .next()
        .and_then(|row| row.elements.into_iter().next())
        .ok_or(ProviderError::NoResult)?;

    match (element.status.as_str(), element.distance, element.duration) {
        ("OK", Some(distance), Some(duration)) => Ok(ProviderDistance {
            distance_meters: distance.value,
            duration_seconds: duration.value,
        }),
        ("ZERO_RESULTS" | "NOT_FOUND", _, _) => Err(ProviderError::NoResult),
        (status, _, _) => Err(ProviderError::Parse(format!("element status {}", status))),
    }
}

fn first_geocode(response: GeocodeResponse) -> Result<GeocodeResult, ProviderError> {
    match response.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" => return Err(ProviderError::NoResult),
        _ => return Err(ProviderError::Status(response.status)),
    }
    let candidate = response
        .results
        .into_iter()
        .next()
        .ok_or(ProviderError::NoResult)?;
    if !candidate.geometry.location.is_valid() {
        return Err(ProviderError::Parse(format!(
            "invalid coordinate {}",
            candidate.geometry.location
        )));
    }
    Ok(GeocodeResult {
        coordinate: candidate.geometry.location,
        formatted_address: candidate.formatted_address,
    })
}

#[async_trait]
impl DistanceProvider for HttpDistanceProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn distance(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> Result<ProviderDistance, ProviderError> {
        let mut query = vec![
            ("origins", origin.to_string()),
            ("destinations", destination.to_string()),
        ];
        query.extend(mode_params(mode));

        debug!(%origin, %destination, mode = mode.as_str(), "Requesting distance");
        let response: MatrixResponse = self.get_json("distancematrix", &query).await?;
        matrix_distance(response)
    }

    async fn geocode(&self, address: &str) -> Result<GeocodeResult, ProviderError> {
        debug!(address, "Requesting geocode");
        let response: GeocodeResponse = self
            .get_json("geocode", &[("address", address.to_string())])
            .await?;
        first_geocode(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_response_parsing() {
        let raw = r#"{
            "status": "OK",
            "rows": [{"elements": [{
                "status": "OK",
                "distance": {"text": "5.4 km", "value": 5412},
                "duration": {"text": "14 mins", "value": 823}
            }]}]
        }"#;
        let parsed = matrix_distance(serde_json::from_str(raw).unwrap()).unwrap();
        assert_eq!(parsed.distance_meters, 5412.0);
        assert_eq!(parsed.duration_seconds, 823.0);

        let none = r#"{"status": "OK", "rows": [{"elements": [{"status": "ZERO_RESULTS"}]}]}"#;
        assert!(matches!(
            matrix_distance(serde_json::from_str(none).unwrap()),
            Err(ProviderError::NoResult)
        ));

        let denied = r#"{"status": "REQUEST_DENIED"}"#;
        assert!(matches!(
            matrix_distance(serde_json::from_str(denied).unwrap()),
            Err(ProviderError::Status(s)) if s == "REQUEST_DENIED"
        ));
    }

    #[test]
    fn test_geocode_response_parsing() {
        let raw = r#"{
            "status": "OK",
            "results": [{
                "formatted_address": "No. 7, Section 5, Xinyi Rd, Taipei",
                "geometry": {"location": {"lat": 25.0339, "lng": 121.5645}}
            }]
        }"#;
        let parsed = first_geocode(serde_json::from_str(raw).unwrap()).unwrap();
        assert_eq!(parsed.coordinate, Coordinate::new(25.0339, 121.5645));

        let empty = r#"{"status": "ZERO_RESULTS", "results": []}"#;
        assert!(matches!(
            first_geocode(serde_json::from_str(empty).unwrap()),
            Err(ProviderError::NoResult)
        ));
    }

    #[test]
    fn test_scooter_avoids_highways() {
        let params = mode_params(TravelMode::Scooter);
        assert!(params.contains(&("avoid", "highways".to_string())));
        assert_eq!(mode_params(TravelMode::Walking), vec![("mode", "walking".to_string())]);
    }

    #[tokio::test]
    async fn test_haversine_provider_cannot_geocode() {
        let provider = HaversineProvider::new(1.3);
        assert!(matches!(
            provider.geocode("Taipei 101").await,
            Err(ProviderError::Unsupported("haversine"))
        ));
        assert!(!provider.can_geocode());
        let d = provider
            .distance(Coordinate::new(25.0, 121.5), Coordinate::new(25.0, 121.5), TravelMode::Driving)
            .await
            .unwrap();
        assert_eq!(d.distance_meters, 0.0);
    }

    #[test]
    fn test_build_from_config() {
        let provider = ProviderConfig::default().build(1.3).unwrap();
        assert_eq!(provider.name(), "haversine");

        let http = ProviderConfig::Http {
            base_url: "https://maps.example.com/maps/api/".into(),
            api_key: None,
            timeout_secs: 2,
        }
        .build(1.3)
        .unwrap();
        assert_eq!(http.name(), "http");
    }
}
