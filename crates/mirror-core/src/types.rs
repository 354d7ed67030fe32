use serde::{Deserialize, Serialize};

/// Coarse position of the mirror, resolved from its public IP address.
///
/// Geolocation services omit fields freely, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl LocationInfo {
    /// Latitude/longitude pair, if the service reported both.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

/// Current conditions, already formatted for display and prompting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherInfo {
    /// e.g. "21.4℃"
    pub temperature: String,
    /// e.g. "20.9℃"
    pub feels_like: String,
    /// Free-text description in the configured language.
    pub weather: String,
    /// e.g. "64%"
    pub humidity: String,
    /// e.g. "3.6 m/s"
    pub wind_speed: String,
}

/// Outcome of a weather query. Failures are carried as data, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WeatherReport {
    Available(WeatherInfo),
    Unavailable { error: String },
}

impl WeatherReport {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self::Unavailable {
            error: error.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// Dominant emotion of the person in frame, or why it could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmotionReading {
    Dominant(String),
    Unavailable { error: String },
}

impl EmotionReading {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self::Unavailable {
            error: error.into(),
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Dominant(label) => Some(label),
            Self::Unavailable { .. } => None,
        }
    }
}

/// Text to be spoken for one job.
///
/// `Degraded` means the vision-language call failed and a canned compliment
/// was substituted; callers that care can tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compliment {
    Genuine(String),
    Degraded { text: String, reason: String },
}

impl Compliment {
    pub fn text(&self) -> &str {
        match self {
            Self::Genuine(text) | Self::Degraded { text, .. } => text,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Face box in source frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

impl Detection {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection { x, y, width: w, height: h, score: 1.0 }
    }

    #[test]
    fn test_iou_identical() {
        let a = boxed(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = boxed(0.0, 0.0, 10.0, 10.0);
        let b = boxed(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = boxed(0.0, 0.0, 10.0, 10.0);
        let b = boxed(5.0, 0.0, 10.0, 10.0);
        // 50 shared over 150 total
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_weather_report_serializes_flat() {
        let report = WeatherReport::Available(WeatherInfo {
            temperature: "21.4℃".into(),
            feels_like: "20.9℃".into(),
            weather: "多云".into(),
            humidity: "64%".into(),
            wind_speed: "3.6 m/s".into(),
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["temperature"], "21.4℃");
        assert_eq!(json["wind_speed"], "3.6 m/s");

        let failed = serde_json::to_string(&WeatherReport::unavailable("no location")).unwrap();
        assert_eq!(failed, r#"{"error":"no location"}"#);
    }

    #[test]
    fn test_emotion_reading_serialization() {
        assert_eq!(
            serde_json::to_string(&EmotionReading::Dominant("happy".into())).unwrap(),
            r#""happy""#
        );
        assert_eq!(
            serde_json::to_string(&EmotionReading::unavailable("Face could not be detected"))
                .unwrap(),
            r#"{"error":"Face could not be detected"}"#
        );
    }

    #[test]
    fn test_compliment_text_and_flag() {
        let genuine = Compliment::Genuine("nice coat".into());
        assert_eq!(genuine.text(), "nice coat");
        assert!(!genuine.is_degraded());

        let degraded = Compliment::Degraded {
            text: "fallback".into(),
            reason: "timeout".into(),
        };
        assert_eq!(degraded.text(), "fallback");
        assert!(degraded.is_degraded());
    }

    #[test]
    fn test_location_coordinates_need_both() {
        let mut loc = LocationInfo {
            latitude: Some(31.2),
            ..Default::default()
        };
        assert_eq!(loc.coordinates(), None);
        loc.longitude = Some(121.5);
        assert_eq!(loc.coordinates(), Some((31.2, 121.5)));
    }
}
