use serde::{Deserialize, Deserializer, Serialize};

/// Codec tag yt-dlp uses for a missing stream.
const NO_CODEC: &str = "none";

/// Resolved metadata for one media resource, as stored in the cache and
/// returned by the info endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    #[serde(default, deserialize_with = "nullable")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub title: String,
    #[serde(default, deserialize_with = "nullable")]
    pub uploader: String,
    /// Seconds.
    #[serde(default, deserialize_with = "whole_number")]
    pub duration: u64,
    #[serde(default, deserialize_with = "whole_number")]
    pub view_count: u64,
    #[serde(default, deserialize_with = "whole_number")]
    pub like_count: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub formats: Vec<FormatDescriptor>,
}

/// One downloadable encoding variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    #[serde(default, deserialize_with = "nullable")]
    pub format_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub resolution: String,
    #[serde(default, deserialize_with = "nullable")]
    pub ext: String,
    /// Bytes; zero or negative when yt-dlp could not size the format.
    #[serde(default, deserialize_with = "signed_number")]
    pub filesize: i64,
    #[serde(rename = "format_note", default, deserialize_with = "nullable")]
    pub note: String,
    #[serde(default, deserialize_with = "nullable")]
    pub acodec: String,
    #[serde(default, deserialize_with = "nullable")]
    pub vcodec: String,
}

impl FormatDescriptor {
    pub fn has_audio(&self) -> bool {
        self.acodec != NO_CODEC
    }

    pub fn has_video(&self) -> bool {
        self.vcodec != NO_CODEC
    }

    pub fn kind(&self) -> FormatKind {
        match (self.has_video(), self.has_audio()) {
            (true, true) => FormatKind::VideoAudio,
            (true, false) => FormatKind::VideoOnly,
            (false, true) => FormatKind::AudioOnly,
            (false, false) => FormatKind::Unknown,
        }
    }
}

/// Stream classification derived from a format's codec tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    VideoAudio,
    VideoOnly,
    AudioOnly,
    Unknown,
}

impl FormatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatKind::VideoAudio => "video+audio",
            FormatKind::VideoOnly => "video-only",
            FormatKind::AudioOnly => "audio-only",
            FormatKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FormatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MediaRecord {
    pub fn format(&self, format_id: &str) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.format_id == format_id)
    }
}

// yt-dlp writes `null` for anything it could not extract.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Counters and durations may come through as floats (`212.0`).
fn whole_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?.unwrap_or_default();
    Ok(if value.is_finite() && value > 0.0 {
        value.trunc() as u64
    } else {
        0
    })
}

fn signed_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?.unwrap_or_default();
    Ok(if value.is_finite() { value.trunc() as i64 } else { 0 })
}
