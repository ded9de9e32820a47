use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::CameraError;
use crate::media::stage::{ByteStream, ChildStage};
use crate::media::types::{PLAYLIST_NAME, PipelineOutput, PipelineSpec, SEGMENT_PATTERN};

const HLS_FLAGS: &str =
    "delete_segments+append_list+independent_segments+omit_endlist+discont_start";

/// Local ffmpeg turning the remote byte stream into files.
pub struct LocalEncoder {
    program: String,
}

impl LocalEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(&self, spec: &PipelineSpec, output: &PipelineOutput) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        match output {
            PipelineOutput::Segmented { dir } => {
                let framerate = spec.framerate.to_string();
                let segment_time = spec.segment_duration().to_string();
                let list_size = spec.playlist_size().to_string();
                let segments = dir.join(SEGMENT_PATTERN);
                let playlist = dir.join(PLAYLIST_NAME);
                push(&[
                    "-hide_banner",
                    "-loglevel",
                    "warning",
                    // low latency input, no probing
                    "-fflags",
                    "+genpts+nobuffer",
                    "-flags",
                    "low_delay",
                    "-probesize",
                    "32",
                    "-analyzeduration",
                    "0",
                    "-f",
                    "h264",
                    "-r",
                    &framerate,
                    "-i",
                    "pipe:0",
                    "-c:v",
                    "copy",
                    "-flush_packets",
                    "1",
                    "-muxdelay",
                    "0",
                    "-muxpreload",
                    "0",
                    "-f",
                    "hls",
                    "-hls_time",
                    &segment_time,
                    "-hls_list_size",
                    &list_size,
                    "-hls_flags",
                    HLS_FLAGS,
                    "-hls_segment_type",
                    "mpegts",
                    "-hls_segment_filename",
                    &segments.to_string_lossy(),
                    &playlist.to_string_lossy(),
                ]);
            }
            PipelineOutput::File { path } => {
                let framerate = spec.framerate.to_string();
                push(&[
                    "-y",
                    "-hide_banner",
                    "-loglevel",
                    "warning",
                    "-f",
                    "h264",
                    "-r",
                    &framerate,
                    "-i",
                    "pipe:0",
                    "-c:v",
                    "copy",
                    "-movflags",
                    "+faststart",
                    &path.to_string_lossy(),
                ]);
            }
            PipelineOutput::Frames {
                dir,
                prefix,
                count,
                interval,
            } => {
                push(&[
                    "-y",
                    "-hide_banner",
                    "-loglevel",
                    "error",
                    "-f",
                    "mjpeg",
                    "-i",
                    "pipe:0",
                ]);
                args.extend(frame_output_args(dir, prefix, *count, *interval));
            }
        }
        args
    }

    /// Arguments sampling jpeg frames from a live playlist another pipeline writes.
    pub fn extract_args(&self, playlist: &Path, output: &PipelineOutput) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        // start at the live edge instead of the oldest listed segment
        args.extend(["-live_start_index", "-1", "-i"].iter().map(|s| s.to_string()));
        args.push(playlist.to_string_lossy().into_owned());
        if let PipelineOutput::Frames {
            dir,
            prefix,
            count,
            interval,
        } = output
        {
            args.extend(frame_output_args(dir, prefix, *count, *interval));
        }
        args
    }

    pub fn spawn(
        &self,
        spec: &PipelineSpec,
        output: &PipelineOutput,
        input: ByteStream,
    ) -> Result<ChildStage, CameraError> {
        let args = self.args(spec, output);
        log::debug!("LocalEncoder: {} {}", self.program, args.join(" "));

        // the Command holding the read end of the pipe is dropped on return
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(input.into_stdio())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CameraError::spawn("encoder", &self.program, e))?;

        Ok(ChildStage::new("encoder", child))
    }

    pub fn spawn_extractor(
        &self,
        playlist: &Path,
        output: &PipelineOutput,
    ) -> Result<ChildStage, CameraError> {
        let args = self.extract_args(playlist, output);
        log::debug!("LocalEncoder: {} {}", self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CameraError::spawn("extractor", &self.program, e))?;

        Ok(ChildStage::new("extractor", child))
    }
}

fn frame_output_args(
    dir: &Path,
    prefix: &str,
    count: u32,
    interval: Option<Duration>,
) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(interval) = interval {
        args.push("-vf".to_string());
        args.push(format!("fps=1/{}", interval.as_secs_f64()));
    }
    args.push("-frames:v".to_string());
    args.push(count.to_string());
    args.push("-q:v".to_string());
    args.push("2".to_string());
    args.push(
        PipelineOutput::frame_pattern(dir, prefix)
            .to_string_lossy()
            .into_owned(),
    );
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_segmented_args() {
        let spec = PipelineSpec::default().with_framerate(25).with_segments(2.0, 5);
        let output = PipelineOutput::Segmented { dir: "/out/hls".into() };
        let args = LocalEncoder::new("ffmpeg").args(&spec, &output);

        assert_eq!(value_after(&args, "-r"), Some("25"));
        assert_eq!(value_after(&args, "-i"), Some("pipe:0"));
        assert_eq!(value_after(&args, "-hls_time"), Some("2"));
        assert_eq!(value_after(&args, "-hls_list_size"), Some("5"));
        assert_eq!(value_after(&args, "-hls_flags"), Some(HLS_FLAGS));
        assert_eq!(
            value_after(&args, "-hls_segment_filename"),
            Some("/out/hls/stream_%03d.ts")
        );
        assert_eq!(args.last().map(String::as_str), Some("/out/hls/stream.m3u8"));
    }

    #[test]
    fn test_file_args_copy_into_mp4() {
        let args = LocalEncoder::new("ffmpeg").args(
            &PipelineSpec::default(),
            &PipelineOutput::File { path: "/out/rec_1.mp4".into() },
        );
        assert_eq!(args.first().map(String::as_str), Some("-y"));
        assert_eq!(value_after(&args, "-c:v"), Some("copy"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/out/rec_1.mp4"));
    }

    #[test]
    fn test_frame_args() {
        let encoder = LocalEncoder::new("ffmpeg");
        let single = PipelineOutput::Frames {
            dir: "/out/frames".into(),
            prefix: "frame_x".into(),
            count: 1,
            interval: None,
        };
        let args = encoder.args(&PipelineSpec::default(), &single);
        assert_eq!(value_after(&args, "-f"), Some("mjpeg"));
        assert_eq!(value_after(&args, "-frames:v"), Some("1"));
        assert!(value_after(&args, "-vf").is_none());
        assert_eq!(args.last().map(String::as_str), Some("/out/frames/frame_x_%03d.jpg"));

        let sampled = PipelineOutput::Frames {
            dir: "/out/frames".into(),
            prefix: "frame_y".into(),
            count: 4,
            interval: Some(Duration::from_millis(500)),
        };
        let args = encoder.args(&PipelineSpec::default(), &sampled);
        assert_eq!(value_after(&args, "-vf"), Some("fps=1/0.5"));
        assert_eq!(value_after(&args, "-frames:v"), Some("4"));
    }

    #[test]
    fn test_extract_args_read_the_live_playlist() {
        let output = PipelineOutput::Frames {
            dir: "/out/frames".into(),
            prefix: "frame_z".into(),
            count: 2,
            interval: Some(Duration::from_secs(1)),
        };
        let playlist = Path::new("/out/hls/stream.m3u8");
        let args = LocalEncoder::new("ffmpeg").extract_args(playlist, &output);

        let live_start = args.iter().position(|a| a == "-live_start_index").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(live_start < input);
        assert_eq!(value_after(&args, "-i"), Some("/out/hls/stream.m3u8"));
        assert!(value_after(&args, "-f").is_none());
        assert_eq!(value_after(&args, "-vf"), Some("fps=1/1"));
        assert_eq!(value_after(&args, "-frames:v"), Some("2"));
        assert_eq!(args.last().map(String::as_str), Some("/out/frames/frame_z_%03d.jpg"));
    }
}
