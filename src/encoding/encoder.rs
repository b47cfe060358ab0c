//! External video encoder fed raw frames over its standard input
//!
//! Each active recording owns one encoder subprocess (ffmpeg by default). The
//! recording path writes frames synchronously, but always from a worker-pool
//! thread, so a slow encoder only ever stalls its own camera.
//!
//! ## Lifecycle
//! - `spawn()` launches the process with an explicit raw-video input description
//! - `write_frame()` pushes exactly one frame worth of bytes
//! - `finish()` closes stdin, waits for the process and maps a non-zero exit
//!   to `EncoderError::Exit`; the output file is never deleted

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{EncoderSettings, PixelFormat};

/// Number of stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Failed to launch encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Frame is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Encoder pipe closed: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("Encoder exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Encoder did not exit within {0:?}")]
    Timeout(Duration),

    #[error("Encoder already finished")]
    Finished,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// Description of the raw byte stream written to the encoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawVideoInput {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub fps: f64,
}

impl RawVideoInput {
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Statistics from an encoding session
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_written: u64,
    pub bytes_written: u64,
    pub encoding_duration: Duration,
    pub average_fps: f64,
}

/// Build the encoder argument list (without `program_args`)
pub fn encoder_args(settings: &EncoderSettings, input: &RawVideoInput, output: &Path) -> Vec<String> {
    let codec = settings.codec;
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        input.pixel_format.ffmpeg_name().into(),
        "-s".into(),
        format!("{}x{}", input.width, input.height),
        "-framerate".into(),
        format!("{}", input.fps),
        "-i".into(),
        "-".into(),
        "-an".into(),
        "-c:v".into(),
        codec.ffmpeg_encoder().into(),
    ];
    args.extend(codec.preset_args(&settings.preset));
    args.extend(codec.quality_args(settings.quality));
    args.push("-pix_fmt".into());
    args.push(codec.output_pix_fmt().into());

    // 4:2:0 output cannot represent odd dimensions
    if input.width % 2 != 0 || input.height % 2 != 0 {
        args.push("-vf".into());
        args.push("pad=ceil(iw/2)*2:ceil(ih/2)*2".into());
    }

    args.push(output.to_string_lossy().to_string());
    args
}

/// A running encoder subprocess for one recording
pub struct EncoderPipe {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    output_path: PathBuf,
    frame_size: usize,
    frames_written: u64,
    started: Instant,
    finish_timeout: Duration,
}

impl EncoderPipe {
    /// Launch the encoder process
    ///
    /// # Arguments
    /// * `settings` - Encoder program, codec and quality
    /// * `input` - Raw frame layout that will be written to stdin
    /// * `output_path` - Container file the encoder writes
    pub fn spawn(settings: &EncoderSettings, input: RawVideoInput, output_path: &Path) -> Result<Self> {
        let args = encoder_args(settings, &input, output_path);
        let program = settings.program.to_string_lossy().to_string();

        log::debug!("[Encoder] Launching {} {:?} {:?}", program, settings.program_args, args);

        let mut child = Command::new(&settings.program)
            .args(&settings.program_args)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        // Drain stderr so a chatty encoder can never block on a full pipe
        let stderr_thread = match child.stderr.take() {
            Some(stderr) => {
                let tail = stderr_tail.clone();
                let label = output_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let spawned = std::thread::Builder::new()
                    .name("camrig-encoder-stderr".into())
                    .spawn(move || {
                        for line in BufReader::new(stderr).lines() {
                            let Ok(line) = line else { break };
                            log::warn!("[Encoder] {}: {}", label, line);
                            let mut tail = tail.lock();
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(EncoderError::Io(e));
                    }
                }
            }
            None => None,
        };

        log::info!(
            "[Encoder] Started {} ({}x{} {} @ {} fps) -> {}",
            settings.codec.display_name(),
            input.width,
            input.height,
            input.pixel_format.ffmpeg_name(),
            input.fps,
            output_path.display()
        );

        Ok(Self {
            child: Some(child),
            stdin,
            stderr_thread,
            stderr_tail,
            output_path: output_path.to_path_buf(),
            frame_size: input.frame_size(),
            frames_written: 0,
            started: Instant::now(),
            finish_timeout: Duration::from_secs(settings.finish_timeout_secs),
        })
    }

    /// Write one frame. Blocks while the encoder's stdin pipe is full.
    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.frame_size {
            return Err(EncoderError::FrameSize {
                expected: self.frame_size,
                actual: data.len(),
            });
        }
        let stdin = self.stdin.as_mut().ok_or(EncoderError::Finished)?;
        stdin.write_all(data).map_err(EncoderError::Pipe)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Frames successfully handed to the encoder so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Last lines the encoder printed on stderr
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Close stdin and wait for the encoder to exit
    pub fn finish(mut self) -> Result<EncoderStats> {
        // EOF lets the encoder flush and write the container trailer
        drop(self.stdin.take());

        let mut child = self.child.take().ok_or(EncoderError::Finished)?;
        let status = wait_with_timeout(&mut child, self.finish_timeout);

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        let status = status?;

        let encoding_duration = self.started.elapsed();
        let bytes_written = std::fs::metadata(&self.output_path)
            .map(|m| m.len())
            .unwrap_or(0);

        if !status.success() {
            log::error!(
                "[Encoder] {} exited with {} after {} frames",
                self.output_path.display(),
                status,
                self.frames_written
            );
            return Err(EncoderError::Exit {
                code: status.code(),
                stderr: self.stderr_tail(),
            });
        }

        let average_fps = if encoding_duration.as_secs_f64() > 0.0 {
            self.frames_written as f64 / encoding_duration.as_secs_f64()
        } else {
            0.0
        };

        log::info!(
            "[Encoder] Finished {}: {} frames, {} bytes, {:.1} fps",
            self.output_path.display(),
            self.frames_written,
            bytes_written,
            average_fps
        );

        Ok(EncoderStats {
            frames_written: self.frames_written,
            bytes_written,
            encoding_duration,
            average_fps,
        })
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            log::error!("[Encoder] Encoder did not exit within {:?}, killing it", timeout);
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncoderError::Timeout(timeout));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

impl Drop for EncoderPipe {
    fn drop(&mut self) {
        drop(self.stdin.take());
        // Not finished explicitly: let the encoder finalize on its own and reap it in the background
        if let Some(mut child) = self.child.take() {
            let _ = std::thread::Builder::new()
                .name("camrig-encoder-reaper".into())
                .spawn(move || {
                    let _ = child.wait();
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::VideoCodec;

    fn input(width: u32, height: u32) -> RawVideoInput {
        RawVideoInput {
            width,
            height,
            pixel_format: PixelFormat::Gray8,
            fps: 29.97,
        }
    }

    #[test]
    fn args_describe_raw_input_and_end_with_output() {
        let settings = EncoderSettings::default();
        let args = encoder_args(&settings, &input(320, 240), Path::new("/tmp/out.mp4"));
        let joined = args.join(" ");

        assert!(joined.contains("-f rawvideo -pix_fmt gray -s 320x240 -framerate 29.97 -i -"));
        assert!(joined.contains("-c:v libx264 -preset veryfast -crf 23 -pix_fmt yuv420p"));
        assert!(!joined.contains("pad="));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn odd_dimensions_get_padded() {
        let settings = EncoderSettings {
            codec: VideoCodec::Mjpeg,
            ..EncoderSettings::default()
        };
        let args = encoder_args(&settings, &input(321, 240), Path::new("out.mp4"));
        assert!(args.iter().any(|a| a.starts_with("pad=")));
        assert!(!args.iter().any(|a| a == "-preset"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let settings = EncoderSettings {
            program: PathBuf::from("/nonexistent/camrig-encoder"),
            ..EncoderSettings::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let result = EncoderPipe::spawn(&settings, input(4, 4), &dir.path().join("x.mp4"));
        assert!(matches!(result, Err(EncoderError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_wrong_frame_size_and_reports_exit_code() {
        let settings = EncoderSettings {
            program: PathBuf::from("sh"),
            program_args: vec!["-c".into(), "cat > /dev/null; exit 3".into(), "encoder".into()],
            ..EncoderSettings::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = EncoderPipe::spawn(&settings, input(4, 4), &dir.path().join("x.mp4")).unwrap();

        assert!(matches!(
            pipe.write_frame(&[0u8; 3]),
            Err(EncoderError::FrameSize { expected: 16, actual: 3 })
        ));
        pipe.write_frame(&[0u8; 16]).unwrap();
        assert_eq!(pipe.frames_written(), 1);

        match pipe.finish() {
            Err(EncoderError::Exit { code, .. }) => assert_eq!(code, Some(3)),
            other => panic!("expected exit error, got {:?}", other.map(|s| s.frames_written)),
        }
    }
}
