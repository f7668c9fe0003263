//! HLS playlist construction and rewriting.
//!
//! Two paths produce a media playlist: building one from the track duration
//! (no encoder involved) and rewriting the encoder's own playlist so its
//! segment URIs point at the streaming endpoints. Both emit version 7 VOD
//! playlists referencing an fMP4 init segment.

use crate::models::{StreamVariant, Track};
use std::fmt::Write;

/// Build the `?format=..&bitrate=..&token=..` suffix for segment URIs.
/// Empty components are omitted.
pub fn query_suffix(variant: &StreamVariant, token: Option<&str>) -> String {
    let mut parts: Vec<String> = vec![format!("format={}", variant.format.as_str())];
    if variant.bitrate_kbps > 0 {
        parts.push(format!("bitrate={}", variant.bitrate_kbps));
    }
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        parts.push(format!("token={}", token));
    }
    format!("?{}", parts.join("&"))
}

/// Build a media playlist from the track duration alone.
pub fn build(
    track: &Track,
    segment_duration_sec: u32,
    params: &str,
) -> String {
    let count = track.segment_count(segment_duration_sec);

    let mut playlist = String::new();
    playlist.push_str("#EXTM3U\n");
    playlist.push_str("#EXT-X-VERSION:7\n");
    let _ = writeln!(playlist, "#EXT-X-TARGETDURATION:{}", segment_duration_sec);
    playlist.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    playlist.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    let _ = writeln!(playlist, "#EXT-X-MAP:URI=\"init.mp4{}\"", params);

    for n in 0..count {
        let duration = track.segment_duration(n, segment_duration_sec);
        // Informational title on the first segment only
        if n == 0 {
            let _ = writeln!(playlist, "#EXTINF:{:.3},{}", duration, title_line(track));
        } else {
            let _ = writeln!(playlist, "#EXTINF:{:.3},", duration);
        }
        let _ = writeln!(playlist, "{}.m4s{}", n, params);
    }

    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

/// Rewrite an encoder-emitted playlist so the init segment and every
/// `segment<N>.m4s` line point at the streaming URL scheme. All other lines
/// pass through verbatim, which makes the rewrite idempotent for a given
/// param set.
pub fn rewrite(source: &str, params: &str) -> String {
    let mut out = String::with_capacity(source.len() + 64);
    for line in source.lines() {
        if line.starts_with("#EXT-X-MAP:") {
            let _ = writeln!(out, "#EXT-X-MAP:URI=\"init.mp4{}\"", params);
        } else if let Some(index) = encoder_segment_index(line) {
            let _ = writeln!(out, "{}.m4s{}", index, params);
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    if !source.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }
    out
}

/// Matches exactly `segment<digits>.m4s`, the encoder's segment naming.
pub(crate) fn encoder_segment_index(line: &str) -> Option<u32> {
    line.strip_prefix("segment")?
        .strip_suffix(".m4s")?
        .parse()
        .ok()
}

fn title_line(track: &Track) -> String {
    match (track.artist.as_deref(), track.title.as_deref()) {
        (Some(artist), Some(title)) => format!("{} - {}", artist, title),
        (None, Some(title)) => title.to_string(),
        (Some(artist), None) => artist.to_string(),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamFormat;
    use chrono::Utc;

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

    fn aac_128(track_id: i64) -> StreamVariant {
        StreamVariant {
            track_id,
            format: StreamFormat::Aac,
            bitrate_kbps: 128,
        }
    }

    #[test]
    fn query_suffix_omits_empty_components() {
        let variant = aac_128(7);
        assert_eq!(query_suffix(&variant, None), "?format=aac&bitrate=128");
        assert_eq!(
            query_suffix(&variant, Some("tok")),
            "?format=aac&bitrate=128&token=tok"
        );

        let lossless = StreamVariant {
            track_id: 7,
            format: StreamFormat::Flac,
            bitrate_kbps: 0,
        };
        assert_eq!(query_suffix(&lossless, None), "?format=flac");
    }

    #[test]
    fn build_emits_vod_playlist_for_32500ms_track() {
        let params = query_suffix(&aac_128(7), None);
        let playlist = build(&track(32_500), 10, &params);

        assert!(playlist.starts_with("#EXTM3U\n#EXT-X-VERSION:7\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:10\n"));
        assert_eq!(
            playlist.matches("#EXT-X-MAP:URI=\"init.mp4?format=aac&bitrate=128\"").count(),
            1
        );
        assert_eq!(playlist.matches("#EXTINF:").count(), 4);
        assert!(playlist.contains("#EXTINF:10.000,Goldberg - Aria\n0.m4s?format=aac&bitrate=128\n"));
        assert!(playlist.contains("#EXTINF:2.500,\n3.m4s?format=aac&bitrate=128\n"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn build_zero_duration_track_is_well_formed() {
        let playlist = build(&track(0), 10, "");

        assert_eq!(playlist.matches("#EXTINF:").count(), 0);
        assert!(playlist.contains("#EXT-X-MAP:URI=\"init.mp4\"\n"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn rewrite_replaces_encoder_uris_and_preserves_the_rest() {
        let source = "#EXTM3U\n\
            #EXT-X-VERSION:7\n\
            #EXT-X-TARGETDURATION:10\n\
            #EXT-X-MEDIA-SEQUENCE:0\n\
            #EXT-X-PLAYLIST-TYPE:VOD\n\
            #EXT-X-MAP:URI=\"init.mp4\"\n\
            #EXTINF:10.000000,\n\
            segment0.m4s\n\
            #EXTINF:2.504000,\n\
            segment1.m4s\n\
            #EXT-X-ENDLIST\n";

        let rewritten = rewrite(source, "?format=aac&bitrate=128&token=tok");

        assert!(rewritten.contains("#EXT-X-MAP:URI=\"init.mp4?format=aac&bitrate=128&token=tok\"\n"));
        assert!(rewritten.contains("0.m4s?format=aac&bitrate=128&token=tok\n"));
        assert!(rewritten.contains("1.m4s?format=aac&bitrate=128&token=tok\n"));
        assert!(!rewritten.contains("segment0"));
        // Encoder's own EXTINF durations pass through untouched
        assert!(rewritten.contains("#EXTINF:2.504000,\n"));
    }

    #[test]
    fn rewrite_is_idempotent_for_the_same_params() {
        let source = "#EXTM3U\n\
            #EXT-X-MAP:URI=\"init.mp4\"\n\
            #EXTINF:10.000000,\n\
            segment0.m4s\n\
            #EXT-X-ENDLIST\n";
        let params = "?format=aac&bitrate=128";

        let once = rewrite(source, params);
        let twice = rewrite(&once, params);

        assert_eq!(once, twice);
    }

    #[test]
    fn rewrite_ignores_lines_that_only_resemble_segments() {
        let source = "segment.m4s\nsegmentX.m4s\nsegment2.mp4\n";
        assert_eq!(rewrite(source, "?format=aac"), source);
    }
}
