//! External encoder invocation.
//!
//! Each HLS generation is one encoder run: the source file goes in, an fMP4
//! init segment, numbered media segments, and the encoder's playlist come out
//! of a per-invocation temp directory and get filed into the stream cache.
//! A second entry point produces single-blob transcodes with no segmentation.

use crate::error::{AppError, Result};
use crate::models::{StreamFormat, StreamVariant};
use crate::services::cache::{CacheKey, StreamCache};
use crate::services::manifest;
use anyhow::Context;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One fully resolved HLS generation request.
#[derive(Debug, Clone)]
pub struct HlsJob {
    pub variant: StreamVariant,
    pub source_path: PathBuf,
    pub segment_duration_sec: u32,
}

/// Seam for the streaming handlers; tests substitute a stub that files
/// placeholder artifacts without spawning a process.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Produce and cache every artifact for the variant: manifest, init
    /// segment, and all media segments.
    async fn generate_hls(&self, job: &HlsJob) -> Result<()>;

    /// Produce a single transcoded blob with no segmentation.
    async fn transcode_blob(
        &self,
        source: &Path,
        format: StreamFormat,
        bitrate_kbps: u32,
    ) -> Result<Vec<u8>>;

    /// Whether the encoder binary answers at all.
    async fn available(&self) -> bool;
}

pub struct FfmpegTranscoder {
    encoder_path: PathBuf,
    cache: Arc<StreamCache>,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(encoder_path: PathBuf, cache: Arc<StreamCache>, timeout: Duration) -> Self {
        FfmpegTranscoder {
            encoder_path,
            cache,
            timeout,
        }
    }

    async fn run(&self, args: Vec<OsString>, what: &str) -> Result<()> {
        let mut command = Command::new(&self.encoder_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // A dropped wait (client gone, nobody else queued on the variant
            // lock) must not leave an orphaned encoder running
            .kill_on_drop(true);

        debug!(encoder = %self.encoder_path.display(), what, "spawning encoder");
        let child = command
            .spawn()
            .map_err(|e| AppError::Transcoder(format!("spawning encoder for {}: {}", what, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| AppError::Transcoder(format!("waiting on encoder for {}: {}", what, e)))?,
            Err(_) => {
                return Err(AppError::Transcoder(format!(
                    "encoder exceeded {}s for {}",
                    self.timeout.as_secs(),
                    what
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Transcoder(format!(
                "encoder exited with {} for {}: {}",
                output.status,
                what,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn generate_hls(&self, job: &HlsJob) -> Result<()> {
        let work_dir = tempfile::Builder::new()
            .prefix("chorus-hls-")
            .tempdir()
            .context("creating encoder work directory")?;

        let args = hls_args(
            &job.source_path,
            work_dir.path(),
            job.variant.format,
            job.variant.bitrate_kbps,
            job.segment_duration_sec,
        );
        self.run(args, &job.variant.key()).await?;

        file_hls_outputs(&self.cache, &job.variant, work_dir.path()).await?;
        info!(variant = %job.variant.key(), "stream generation complete");
        Ok(())
        // work_dir drops here, removing partial or leftover encoder output
    }

    async fn transcode_blob(
        &self,
        source: &Path,
        format: StreamFormat,
        bitrate_kbps: u32,
    ) -> Result<Vec<u8>> {
        let work_dir = tempfile::Builder::new()
            .prefix("chorus-blob-")
            .tempdir()
            .context("creating encoder work directory")?;

        let container = blob_container(format);
        let out_path = work_dir.path().join(format!("out.{}", container));

        let mut args: Vec<OsString> = base_args(source);
        args.extend(blob_codec_args(format, bitrate_kbps).into_iter().map(Into::into));
        args.push("-f".into());
        args.push(container.into());
        args.push(out_path.clone().into());

        self.run(args, &format!("blob transcode to {}", container)).await?;

        let bytes = tokio::fs::read(&out_path)
            .await
            .context("reading transcoded blob")?;
        Ok(bytes)
    }

    async fn available(&self) -> bool {
        Command::new(&self.encoder_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

fn base_args(source: &Path) -> Vec<OsString> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        source.into(),
        "-vn".into(),
    ]
}

/// Codec selection for the fMP4 HLS path. MP3 in fMP4 is ill-supported by
/// players, so an `mp3` target gets AAC inside the segments.
fn hls_codec_args(format: StreamFormat, bitrate_kbps: u32) -> Vec<String> {
    let lossy = |codec: &str, default_kbps: u32| {
        let kbps = if bitrate_kbps > 0 { bitrate_kbps } else { default_kbps };
        vec![
            "-c:a".to_string(),
            codec.to_string(),
            "-b:a".to_string(),
            format!("{}k", kbps),
        ]
    };
    match format {
        StreamFormat::Mp3 => lossy("aac", 320),
        StreamFormat::Aac => lossy("aac", 256),
        StreamFormat::Opus => lossy("libopus", 256),
        StreamFormat::Flac => vec![
            "-c:a".to_string(),
            "flac".to_string(),
            "-strict".to_string(),
            "-2".to_string(),
        ],
        StreamFormat::Alac => vec!["-c:a".to_string(), "alac".to_string()],
        StreamFormat::Wav => lossy("aac", 256),
    }
}

fn hls_args(
    source: &Path,
    out_dir: &Path,
    format: StreamFormat,
    bitrate_kbps: u32,
    segment_duration_sec: u32,
) -> Vec<OsString> {
    let mut args = base_args(source);
    args.extend(hls_codec_args(format, bitrate_kbps).into_iter().map(OsString::from));
    args.extend([
        OsString::from("-f"),
        "hls".into(),
        "-hls_time".into(),
        segment_duration_sec.to_string().into(),
        "-hls_playlist_type".into(),
        "vod".into(),
        "-hls_segment_type".into(),
        "fmp4".into(),
        "-hls_fmp4_init_filename".into(),
        "init.mp4".into(),
        "-hls_segment_filename".into(),
        out_dir.join("segment%d.m4s").into(),
        out_dir.join("playlist.m3u8").into(),
    ]);
    args
}

/// Container for the single-blob path. Unknown targets fall back to mp3.
fn blob_container(format: StreamFormat) -> &'static str {
    match format {
        StreamFormat::Mp3 | StreamFormat::Wav => "mp3",
        StreamFormat::Aac => "adts",
        StreamFormat::Opus => "opus",
        StreamFormat::Flac => "flac",
        StreamFormat::Alac => "ipod",
    }
}

fn blob_codec_args(format: StreamFormat, bitrate_kbps: u32) -> Vec<String> {
    let lossy = |codec: &str, default_kbps: u32| {
        let kbps = if bitrate_kbps > 0 { bitrate_kbps } else { default_kbps };
        vec![
            "-c:a".to_string(),
            codec.to_string(),
            "-b:a".to_string(),
            format!("{}k", kbps),
        ]
    };
    match format {
        StreamFormat::Mp3 | StreamFormat::Wav => lossy("libmp3lame", 320),
        StreamFormat::Aac => lossy("aac", 256),
        StreamFormat::Opus => lossy("libopus", 256),
        StreamFormat::Flac => vec!["-c:a".to_string(), "flac".to_string()],
        StreamFormat::Alac => vec!["-c:a".to_string(), "alac".to_string()],
    }
}

/// File the encoder's output into the cache: playlist, init segment, then
/// every `segment<N>.m4s`. An individual put failure is a warning; the
/// request only fails if its own artifact is still missing afterwards,
/// which the caller detects by re-consulting the cache.
async fn file_hls_outputs(
    cache: &StreamCache,
    variant: &StreamVariant,
    dir: &Path,
) -> Result<()> {
    let playlist = tokio::fs::read(dir.join("playlist.m3u8"))
        .await
        .context("encoder produced no playlist")?;
    if let Err(e) = cache.put(&CacheKey::manifest(variant), &playlist).await {
        warn!(variant = %variant.key(), error = %e, "failed to cache playlist");
    }

    let init = tokio::fs::read(dir.join("init.mp4"))
        .await
        .context("encoder produced no init segment")?;
    if let Err(e) = cache.put(&CacheKey::init(variant), &init).await {
        warn!(variant = %variant.key(), error = %e, "failed to cache init segment");
    }

    let mut segments = 0u32;
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .context("reading encoder output directory")?;
    while let Some(dirent) = read_dir
        .next_entry()
        .await
        .context("reading encoder output directory")?
    {
        let name = dirent.file_name();
        let Some(index) = name.to_str().and_then(manifest::encoder_segment_index) else {
            continue;
        };
        let bytes = tokio::fs::read(dirent.path())
            .await
            .with_context(|| format!("reading encoder segment {}", index))?;
        if let Err(e) = cache.put(&CacheKey::segment(variant, index), &bytes).await {
            warn!(variant = %variant.key(), segment = index, error = %e, "failed to cache segment");
            continue;
        }
        segments += 1;
    }

    debug!(variant = %variant.key(), segments, "filed encoder output");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::coordinator::GenerationGate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn aac_variant() -> StreamVariant {
        StreamVariant {
            track_id: 7,
            format: StreamFormat::Aac,
            bitrate_kbps: 128,
        }
    }

    #[test]
    fn hls_codec_args_follow_the_format_table() {
        assert_eq!(
            hls_codec_args(StreamFormat::Mp3, 0),
            ["-c:a", "aac", "-b:a", "320k"]
        );
        assert_eq!(
            hls_codec_args(StreamFormat::Aac, 0),
            ["-c:a", "aac", "-b:a", "256k"]
        );
        assert_eq!(
            hls_codec_args(StreamFormat::Opus, 96),
            ["-c:a", "libopus", "-b:a", "96k"]
        );
        assert_eq!(
            hls_codec_args(StreamFormat::Flac, 0),
            ["-c:a", "flac", "-strict", "-2"]
        );
        assert_eq!(hls_codec_args(StreamFormat::Alac, 0), ["-c:a", "alac"]);
    }

    #[test]
    fn request_bitrate_overrides_default() {
        assert_eq!(
            hls_codec_args(StreamFormat::Aac, 128),
            ["-c:a", "aac", "-b:a", "128k"]
        );
    }

    #[test]
    fn hls_args_configure_the_fmp4_muxer() {
        let args = hls_args(
            Path::new("/music/aria.flac"),
            Path::new("/tmp/work"),
            StreamFormat::Aac,
            128,
            10,
        );
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        for expected in [
            "-vn",
            "-f",
            "hls",
            "-hls_time",
            "10",
            "-hls_playlist_type",
            "vod",
            "-hls_segment_type",
            "fmp4",
            "-hls_fmp4_init_filename",
            "init.mp4",
        ] {
            assert!(rendered.iter().any(|a| a == expected), "missing {}", expected);
        }
        assert!(rendered.iter().any(|a| a.ends_with("segment%d.m4s")));
        assert!(rendered.last().unwrap().ends_with("playlist.m3u8"));
    }

    #[test]
    fn blob_containers_match_their_format() {
        assert_eq!(blob_container(StreamFormat::Mp3), "mp3");
        assert_eq!(blob_container(StreamFormat::Aac), "adts");
        assert_eq!(blob_container(StreamFormat::Opus), "opus");
        assert_eq!(blob_container(StreamFormat::Flac), "flac");
        assert_eq!(blob_container(StreamFormat::Alac), "ipod");
        // Unknown blob targets fall back to mp3
        assert_eq!(blob_container(StreamFormat::Wav), "mp3");
        assert_eq!(
            blob_codec_args(StreamFormat::Wav, 0),
            ["-c:a", "libmp3lame", "-b:a", "320k"]
        );
    }

    #[tokio::test]
    async fn encoder_output_is_filed_under_variant_keys() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = StreamCache::open(
            cache_dir.path().to_path_buf(),
            1024 * 1024,
            Duration::ZERO,
        )
        .await
        .unwrap();
        let out = tempfile::tempdir().unwrap();

        std::fs::write(out.path().join("playlist.m3u8"), b"#EXTM3U\n").unwrap();
        std::fs::write(out.path().join("init.mp4"), b"ftyp").unwrap();
        for n in 0..4 {
            std::fs::write(out.path().join(format!("segment{}.m4s", n)), b"moof").unwrap();
        }
        std::fs::write(out.path().join("segmentX.m4s"), b"junk").unwrap();

        let variant = aac_variant();
        file_hls_outputs(&cache, &variant, out.path()).await.unwrap();

        assert!(cache.has(&CacheKey::manifest(&variant)));
        assert!(cache.has(&CacheKey::init(&variant)));
        for n in 0..4 {
            assert!(cache.has(&CacheKey::segment(&variant, n)));
        }
        assert!(!cache.has(&CacheKey::segment(&variant, 5)));
    }

    #[tokio::test]
    async fn missing_playlist_fails_the_generation() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = StreamCache::open(
            cache_dir.path().to_path_buf(),
            1024 * 1024,
            Duration::ZERO,
        )
        .await
        .unwrap();
        let out = tempfile::tempdir().unwrap();

        let result = file_hls_outputs(&cache, &aac_variant(), out.path()).await;
        assert!(result.is_err());
    }

    /// Stub encoder: files one placeholder artifact per segment and counts
    /// invocations, standing in for the external process.
    struct StubTranscoder {
        cache: Arc<StreamCache>,
        segments: u32,
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl Transcoder for StubTranscoder {
        async fn generate_hls(&self, job: &HlsJob) -> Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.cache
                .put(&CacheKey::manifest(&job.variant), b"#EXTM3U\n")
                .await?;
            self.cache.put(&CacheKey::init(&job.variant), b"ftyp").await?;
            for n in 0..self.segments {
                self.cache
                    .put(&CacheKey::segment(&job.variant, n), b"moof")
                    .await?;
            }
            Ok(())
        }

        async fn transcode_blob(&self, _: &Path, _: StreamFormat, _: u32) -> Result<Vec<u8>> {
            Ok(b"blob".to_vec())
        }

        async fn available(&self) -> bool {
            true
        }
    }

    /// Two concurrent cold-cache requests for different segments of the same
    /// variant spawn the encoder exactly once.
    #[tokio::test]
    async fn concurrent_segment_requests_share_one_generation() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            StreamCache::open(cache_dir.path().to_path_buf(), 1024 * 1024, Duration::ZERO)
                .await
                .unwrap(),
        );
        let transcoder = Arc::new(StubTranscoder {
            cache: cache.clone(),
            segments: 4,
            invocations: AtomicUsize::new(0),
        });
        let gate = Arc::new(GenerationGate::new());

        let job = HlsJob {
            variant: aac_variant(),
            source_path: PathBuf::from("/music/aria.flac"),
            segment_duration_sec: 10,
        };

        let mut tasks = Vec::new();
        for requested in [0u32, 2u32] {
            let cache = cache.clone();
            let transcoder = transcoder.clone();
            let gate = gate.clone();
            let job = job.clone();
            tasks.push(tokio::spawn(async move {
                let key = CacheKey::segment(&job.variant, requested);
                if cache.get(&key).await.is_some() {
                    return true;
                }
                let guard = gate.acquire(&job.variant.key()).await;
                if !cache.has(&key) {
                    transcoder.generate_hls(&job).await.unwrap();
                }
                drop(guard);
                cache.get(&key).await.is_some()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(transcoder.invocations.load(Ordering::SeqCst), 1);
        let variant = aac_variant();
        assert!(cache.has(&CacheKey::segment(&variant, 0)));
        assert!(cache.has(&CacheKey::segment(&variant, 2)));
    }
}
