use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A library track as produced by the scanner. The streaming core only
/// reads these; it never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Track {
    pub id: i64,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub source_path: String,
    pub container_format: String,
    pub bitrate_kbps: i32,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl Track {
    /// Number of HLS segments for this track at the given target duration.
    pub fn segment_count(&self, segment_duration_sec: u32) -> u32 {
        let segment_ms = u64::from(segment_duration_sec) * 1000;
        if segment_ms == 0 {
            return 0;
        }
        let duration_ms = self.duration_ms.max(0) as u64;
        duration_ms.div_ceil(segment_ms) as u32
    }

    /// Duration of segment `n` in seconds. Every segment is the target
    /// duration except the last, which carries the remainder.
    pub fn segment_duration(&self, n: u32, segment_duration_sec: u32) -> f64 {
        let count = self.segment_count(segment_duration_sec);
        if count == 0 || n >= count {
            return 0.0;
        }
        if n + 1 < count {
            return f64::from(segment_duration_sec);
        }
        let full_ms = u64::from(count - 1) * u64::from(segment_duration_sec) * 1000;
        let last_ms = (self.duration_ms.max(0) as u64).saturating_sub(full_ms);
        last_ms as f64 / 1000.0
    }
}

/// Target formats the streaming engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Mp3,
    Aac,
    Opus,
    Flac,
    Alac,
    Wav,
}

impl StreamFormat {
    pub const ALL: [StreamFormat; 6] = [
        StreamFormat::Mp3,
        StreamFormat::Aac,
        StreamFormat::Opus,
        StreamFormat::Flac,
        StreamFormat::Alac,
        StreamFormat::Wav,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Some(StreamFormat::Mp3),
            "aac" => Some(StreamFormat::Aac),
            "opus" => Some(StreamFormat::Opus),
            "flac" => Some(StreamFormat::Flac),
            "alac" => Some(StreamFormat::Alac),
            "wav" => Some(StreamFormat::Wav),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Mp3 => "mp3",
            StreamFormat::Aac => "aac",
            StreamFormat::Opus => "opus",
            StreamFormat::Flac => "flac",
            StreamFormat::Alac => "alac",
            StreamFormat::Wav => "wav",
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, StreamFormat::Flac | StreamFormat::Alac | StreamFormat::Wav)
    }

    /// Encoder bitrate in kbps used when the request does not pick one.
    /// Lossless formats have no bitrate knob.
    pub fn default_bitrate(&self) -> u32 {
        match self {
            StreamFormat::Mp3 => 320,
            StreamFormat::Aac => 256,
            StreamFormat::Opus => 256,
            StreamFormat::Flac | StreamFormat::Alac | StreamFormat::Wav => 0,
        }
    }
}

/// The unit of caching and single-flight coordination: one target rendition
/// of one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamVariant {
    pub track_id: i64,
    pub format: StreamFormat,
    pub bitrate_kbps: u32,
}

impl StreamVariant {
    /// Canonical `<track_id>:<format>:<bitrate>` string. Cache scopes and the
    /// generation gate both key off this.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.track_id, self.format.as_str(), self.bitrate_kbps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(duration_ms: i64) -> Track {
        Track {
            id: 7,
            title: Some("Aria".to_string()),
            artist: Some("Goldberg".to_string()),
            album: None,
            source_path: "/music/aria.flac".to_string(),
            container_format: "flac".to_string(),
            bitrate_kbps: 1411,
            duration_ms,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn segment_count_rounds_up() {
        assert_eq!(track(32_500).segment_count(10), 4);
        assert_eq!(track(30_000).segment_count(10), 3);
        assert_eq!(track(1).segment_count(10), 1);
        assert_eq!(track(0).segment_count(10), 0);
    }

    #[test]
    fn last_segment_carries_remainder() {
        let t = track(32_500);
        assert_eq!(t.segment_duration(0, 10), 10.0);
        assert_eq!(t.segment_duration(2, 10), 10.0);
        assert_eq!(t.segment_duration(3, 10), 2.5);
    }

    #[test]
    fn exact_multiple_has_full_last_segment() {
        let t = track(30_000);
        assert_eq!(t.segment_count(10), 3);
        assert_eq!(t.segment_duration(2, 10), 10.0);
    }

    #[test]
    fn segment_durations_sum_to_duration() {
        let t = track(187_345);
        let n = t.segment_count(10);
        let total_ms: f64 = (0..n).map(|i| t.segment_duration(i, 10) * 1000.0).sum();
        assert!((total_ms - 187_345.0).abs() < 1.0);
    }

    #[test]
    fn format_parse_round_trip() {
        for f in StreamFormat::ALL {
            assert_eq!(StreamFormat::parse(f.as_str()), Some(f));
        }
        assert_eq!(StreamFormat::parse("ogg"), None);
    }

    #[test]
    fn variant_key_is_canonical() {
        let v = StreamVariant {
            track_id: 7,
            format: StreamFormat::Aac,
            bitrate_kbps: 128,
        };
        assert_eq!(v.key(), "7:aac:128");
    }
}
