//! Prompt rendering, local timestamps and the canned fallback compliments.

use crate::types::{EmotionReading, LocationInfo, WeatherReport};
use chrono::{DateTime, Local};
use rand::seq::SliceRandom;
use rand::Rng;

/// Default instruction sent to the vision-language model alongside the photo.
///
/// Placeholders: `{weather}`, `{location}`, `{time}`, `{emotion}`.
pub const DEFAULT_TEMPLATE: &str = "请根据这张人物照片，生成一段热情洋溢的穿衣搭配夸奖。重点描述：
    1. 服装的颜色搭配和风格
    2. 整体的时尚感和个人气质
    3. 具体的穿搭亮点
    要求语言生动有趣，充满赞美之情，长度在50-80字左右,并结合以下时间地点天气情绪信息
    天气{weather}
    地点是{location}
    时间是{time}
    人物的心情是{emotion}
";

/// Spoken instead of a generated compliment when the model cannot be reached.
pub const FALLBACK_COMPLIMENTS: [&str; 4] = [
    "哇!你这身搭配真是太有品味了!颜色的搭配非常和谐，整体造型既时尚又显气质，完美展现了你的个人风格!",
    "今天的穿搭真是让人眼前一亮!服装的剪裁和配色都恰到好处，既显瘦又显高，简直是时尚达人的典范!",
    "这套衣服真的太适合你了!简约而不简单，细节处见真章，完美衬托出你的优雅气质和时尚感!",
    "你的穿衣风格总是这么出众!这次的搭配色彩明快，款式新颖，既显年轻活力又不失稳重，真是太棒了!",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Everything the prompt mentions besides the photo itself.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub weather: WeatherReport,
    pub location: Option<LocationInfo>,
    pub time: String,
    pub emotion: EmotionReading,
}

impl PromptContext {
    /// Render the context into `template`, substituting each placeholder.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{weather}", &to_json(&self.weather))
            .replace("{location}", &self.location_text())
            .replace("{time}", &self.time)
            .replace("{emotion}", &self.emotion_text())
    }

    fn location_text(&self) -> String {
        match &self.location {
            Some(location) => to_json(location),
            None => "unknown".to_string(),
        }
    }

    fn emotion_text(&self) -> String {
        match &self.emotion {
            EmotionReading::Dominant(label) => label.clone(),
            unavailable => to_json(unavailable),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Format a wall-clock time the way prompts and the CLI show it.
pub fn format_timestamp(at: &DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Current local time, formatted.
pub fn timestamp_now() -> String {
    format_timestamp(&Local::now())
}

/// Pick one of the [`FALLBACK_COMPLIMENTS`] at random.
pub fn fallback_compliment<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    FALLBACK_COMPLIMENTS
        .choose(rng)
        .copied()
        .unwrap_or(FALLBACK_COMPLIMENTS[0])
}
