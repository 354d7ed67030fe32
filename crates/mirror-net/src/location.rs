//! IP geolocation lookup.

use std::time::Duration;

use mirror_core::config::{LocationProvider, LocationSettings};
use mirror_core::LocationInfo;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use serde::Deserialize;

use crate::client::{build_client, check_status, NetError};

const SERVICE: &str = "location";

// ip.sb answers 403 to clients that do not look like a browser.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36 Edg/142.0.0.0";
const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,\
     image/avif,image/webp,image/apng,*/*;q=0.8";
const BROWSER_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8,en-GB;q=0.7,en-US;q=0.6";

/// Raw geolocation payload. Providers disagree on the country key.
#[derive(Debug, Deserialize)]
struct GeoPayload {
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    country_name: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl GeoPayload {
    fn into_location(self, provider: LocationProvider) -> LocationInfo {
        let country = match provider {
            LocationProvider::IpSb => self.country,
            LocationProvider::IpApi => self.country_name,
        };
        LocationInfo {
            city: self.city,
            region: self.region,
            country,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

pub struct LocationClient {
    http: reqwest::Client,
    url: String,
    provider: LocationProvider,
}

impl LocationClient {
    pub fn new(settings: &LocationSettings) -> Result<Self, NetError> {
        Ok(Self {
            http: build_client(Duration::from_secs(settings.timeout_secs))?,
            url: settings.endpoint().to_string(),
            provider: settings.provider,
        })
    }

    /// Look up where this machine's public address is.
    pub async fn locate(&self) -> Result<LocationInfo, NetError> {
        let mut request = self.http.get(&self.url);
        if self.provider == LocationProvider::IpSb {
            request = request.headers(browser_headers());
        }
        let response = check_status(SERVICE, request.send().await?).await?;
        let payload: GeoPayload = response.json().await?;
        let location = payload.into_location(self.provider);
        tracing::debug!(
            city = location.city.as_deref().unwrap_or("?"),
            country = location.country.as_deref().unwrap_or("?"),
            "location resolved"
        );
        Ok(location)
    }

    /// [`locate`](Self::locate) with failures logged and mapped to `None`.
    pub async fn locate_or_none(&self) -> Option<LocationInfo> {
        match self.locate().await {
            Ok(location) => Some(location),
            Err(e) => {
                tracing::warn!(error = %e, "location lookup failed");
                None
            }
        }
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(BROWSER_LANGUAGE));
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Chromium\";v=\"142\", \"Microsoft Edge\";v=\"142\", \"Not_A Brand\";v=\"99\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_server;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};

    fn settings(provider: LocationProvider, base: &str) -> LocationSettings {
        LocationSettings {
            provider,
            url: Some(format!("{base}/geo")),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_payload_country_by_provider() {
        let json = r#"{"city":"Hangzhou","country":"China","country_name":"People's Republic of China","latitude":30.29,"longitude":120.16}"#;
        let sb: GeoPayload = serde_json::from_str(json).unwrap();
        assert_eq!(
            sb.into_location(LocationProvider::IpSb).country.as_deref(),
            Some("China")
        );
        let api: GeoPayload = serde_json::from_str(json).unwrap();
        assert_eq!(
            api.into_location(LocationProvider::IpApi).country.as_deref(),
            Some("People's Republic of China")
        );
    }

    #[test]
    fn test_payload_tolerates_missing_fields() {
        let payload: GeoPayload = serde_json::from_str(r#"{"ip":"1.2.3.4"}"#).unwrap();
        let location = payload.into_location(LocationProvider::IpSb);
        assert_eq!(location, LocationInfo::default());
        assert!(location.coordinates().is_none());
    }

    #[tokio::test]
    async fn test_ip_sb_sends_browser_headers() {
        let app = Router::new().route(
            "/geo",
            get(|headers: AxumHeaders| async move {
                let ua = headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                if !ua.starts_with("Mozilla/5.0") {
                    return Err(StatusCode::FORBIDDEN);
                }
                Ok(Json(serde_json::json!({
                    "city": "Hangzhou",
                    "region": "Zhejiang",
                    "country": "China",
                    "latitude": 30.29,
                    "longitude": 120.16
                })))
            }),
        );
        let base = test_server::spawn(app).await;
        let client = LocationClient::new(&settings(LocationProvider::IpSb, &base)).unwrap();

        let location = client.locate().await.unwrap();
        assert_eq!(location.city.as_deref(), Some("Hangzhou"));
        assert_eq!(location.coordinates(), Some((30.29, 120.16)));
    }

    #[tokio::test]
    async fn test_status_error_becomes_none() {
        let app = Router::new().route("/geo", get(|| async { StatusCode::TOO_MANY_REQUESTS }));
        let base = test_server::spawn(app).await;
        let client = LocationClient::new(&settings(LocationProvider::IpApi, &base)).unwrap();

        assert!(matches!(
            client.locate().await,
            Err(NetError::Status { status, .. }) if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        ));
        assert!(client.locate_or_none().await.is_none());
    }
}
