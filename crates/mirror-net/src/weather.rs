//! Current conditions from OpenWeatherMap.

use std::time::Duration;

use mirror_core::config::WeatherSettings;
use mirror_core::{LocationInfo, WeatherInfo, WeatherReport};
use serde::Deserialize;
use serde_json::Number;

use crate::client::{build_client, check_status, require, NetError};
use crate::location::LocationClient;

const SERVICE: &str = "weather";

const NO_LOCATION: &str = "无法获取当前位置信息";
const NO_WEATHER: &str = "无法获取天气信息";

#[derive(Debug, Deserialize)]
struct OwmResponse {
    main: OwmMain,
    weather: Vec<OwmCondition>,
    wind: OwmWind,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    feels_like: f64,
    // Kept as `Number` so integers print without a trailing ".0"
    humidity: Number,
}

#[derive(Debug, Deserialize)]
struct OwmCondition {
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: Number,
}

impl OwmResponse {
    fn into_info(self) -> Result<WeatherInfo, NetError> {
        let description = self
            .weather
            .into_iter()
            .next()
            .map(|c| c.description)
            .ok_or_else(|| NetError::malformed(SERVICE, "empty weather list"))?;
        Ok(WeatherInfo {
            temperature: format!("{:.1}℃", self.main.temp),
            feels_like: format!("{:.1}℃", self.main.feels_like),
            weather: description,
            humidity: format!("{}%", self.main.humidity),
            wind_speed: format!("{} m/s", self.wind.speed),
        })
    }
}

pub struct WeatherClient {
    http: reqwest::Client,
    settings: WeatherSettings,
}

impl WeatherClient {
    pub fn new(settings: &WeatherSettings) -> Result<Self, NetError> {
        Ok(Self {
            http: build_client(Duration::from_secs(settings.timeout_secs))?,
            settings: settings.clone(),
        })
    }

    /// Current weather at a coordinate.
    pub async fn fetch(&self, latitude: f64, longitude: f64) -> Result<WeatherInfo, NetError> {
        let api_key = require(&self.settings.api_key, "weather API key")?;
        let response = self
            .http
            .get(&self.settings.url)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("appid", api_key.to_string()),
                ("units", self.settings.units.clone()),
                ("lang", self.settings.lang.clone()),
            ])
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;
        let body: OwmResponse = response
            .json()
            .await
            .map_err(|e| NetError::malformed(SERVICE, e.to_string()))?;
        body.into_info()
    }

    /// Weather for an already resolved location. Never fails; problems are
    /// reported inside the returned value.
    pub async fn report_for(&self, location: Option<&LocationInfo>) -> WeatherReport {
        let Some((latitude, longitude)) = location.and_then(LocationInfo::coordinates) else {
            return WeatherReport::unavailable(NO_LOCATION);
        };
        match self.fetch(latitude, longitude).await {
            Ok(info) => WeatherReport::Available(info),
            Err(e) => {
                tracing::warn!(error = %e, "weather lookup failed");
                WeatherReport::unavailable(NO_WEATHER)
            }
        }
    }
}

/// Locate this machine, then fetch the weather there.
pub async fn current_weather(location: &LocationClient, weather: &WeatherClient) -> WeatherReport {
    let here = location.locate_or_none().await;
    weather.report_for(here.as_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_server;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use mirror_core::config::{LocationProvider, LocationSettings};
    use std::collections::HashMap;

    const SAMPLE: &str = r#"{
        "weather": [{"id": 500, "main": "Rain", "description": "小雨"}],
        "main": {"temp": 21.44, "feels_like": 20.96, "humidity": 64},
        "wind": {"speed": 3.6}
    }"#;

    fn settings(base: &str, api_key: Option<&str>) -> WeatherSettings {
        WeatherSettings {
            url: format!("{base}/weather"),
            api_key: api_key.map(str::to_string),
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_formats_sample_response() {
        let body: OwmResponse = serde_json::from_str(SAMPLE).unwrap();
        let info = body.into_info().unwrap();
        assert_eq!(info.temperature, "21.4℃");
        assert_eq!(info.feels_like, "21.0℃");
        assert_eq!(info.weather, "小雨");
        assert_eq!(info.humidity, "64%");
        assert_eq!(info.wind_speed, "3.6 m/s");
    }

    #[test]
    fn test_empty_condition_list_is_malformed() {
        let body: OwmResponse = serde_json::from_str(
            r#"{"weather":[],"main":{"temp":1,"feels_like":1,"humidity":1},"wind":{"speed":1}}"#,
        )
        .unwrap();
        assert!(matches!(body.into_info(), Err(NetError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_fetch_sends_coordinates_and_options() {
        let app = Router::new().route(
            "/weather",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let ok = q.get("lat").map(String::as_str) == Some("30.29")
                    && q.get("lon").map(String::as_str) == Some("120.16")
                    && q.get("appid").map(String::as_str) == Some("k")
                    && q.get("units").map(String::as_str) == Some("metric")
                    && q.get("lang").map(String::as_str) == Some("zh_cn");
                if !ok {
                    return Err(StatusCode::BAD_REQUEST);
                }
                Ok(Json(serde_json::from_str::<serde_json::Value>(SAMPLE).unwrap()))
            }),
        );
        let base = test_server::spawn(app).await;
        let client = WeatherClient::new(&settings(&base, Some("k"))).unwrap();

        let info = client.fetch(30.29, 120.16).await.unwrap();
        assert_eq!(info.weather, "小雨");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let client = WeatherClient::new(&settings("http://127.0.0.1:9", None)).unwrap();
        assert!(matches!(
            client.fetch(0.0, 0.0).await,
            Err(NetError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_report_without_coordinates_is_tagged() {
        let client = WeatherClient::new(&settings("http://127.0.0.1:9", Some("k"))).unwrap();
        let report = client.report_for(Some(&LocationInfo::default())).await;
        assert_eq!(report, WeatherReport::unavailable(NO_LOCATION));
        assert_eq!(client.report_for(None).await, WeatherReport::unavailable(NO_LOCATION));
    }

    #[tokio::test]
    async fn test_current_weather_tags_upstream_failure() {
        let app = Router::new()
            .route(
                "/geo",
                get(|| async {
                    Json(serde_json::json!({"country": "China", "latitude": 1.0, "longitude": 2.0}))
                }),
            )
            .route("/weather", get(|| async { StatusCode::UNAUTHORIZED }));
        let base = test_server::spawn(app).await;
        let location = LocationClient::new(&LocationSettings {
            provider: LocationProvider::IpSb,
            url: Some(format!("{base}/geo")),
            timeout_secs: 5,
        })
        .unwrap();
        let weather = WeatherClient::new(&settings(&base, Some("k"))).unwrap();

        let report = current_weather(&location, &weather).await;
        assert!(!report.is_available());
        assert_eq!(report, WeatherReport::unavailable(NO_WEATHER));
    }
}
