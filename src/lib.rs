// CamRig - Multi-camera acquisition and recording
// Main library entry point

pub mod config;
pub mod devices;
pub mod encoding;
pub mod recording;
pub mod session;

use std::io::BufRead;
use std::path::PathBuf;

use config::Config;
use recording::{CameraEvent, CoordinatorSettings, RecordingCoordinator};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "CAMRIG_CONFIG";

/// Environment variable holding the subject id used for every camera
pub const SUBJECT_ENV: &str = "CAMRIG_SUBJECT";

const DEFAULT_SUBJECT: &str = "session";

/// Open every configured camera, record until Enter is pressed, then finalize
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let config = Config::load_or_default(&config_path);
    if !config_path.exists() {
        config.save(&config_path)?;
        log::info!("Wrote default config to {}", config_path.display());
    }

    let subject_id = std::env::var(SUBJECT_ENV).unwrap_or_else(|_| DEFAULT_SUBJECT.to_string());

    let mut coordinator = RecordingCoordinator::new(CoordinatorSettings::from(&config))?;

    for camera in &config.cameras {
        let device = match devices::open_device(camera) {
            Ok(device) => device,
            Err(e) => {
                log::error!("Could not open {} ({}): {}", camera.id, camera.backend.display_name(), e);
                continue;
            }
        };
        if let Err(e) = coordinator.attach_camera(camera.clone(), device) {
            log::error!("Could not attach {}: {}", camera.id, e);
        }
    }

    if coordinator.camera_ids().is_empty() {
        anyhow::bail!("No cameras could be opened");
    }

    spawn_event_logger(coordinator.events())?;

    for camera in &config.cameras {
        if !coordinator.camera_ids().contains(&camera.id) {
            continue;
        }
        let save_dir = config.save_dir_for(camera);
        match coordinator.start_recording(&camera.id, &subject_id, &save_dir) {
            Ok(paths) => log::info!("{} -> {}", camera.id, paths.video.display()),
            Err(e) => log::error!("Could not start recording {}: {}", camera.id, e),
        }
    }

    println!("Recording. Press Enter to stop.");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    for camera_id in coordinator.camera_ids() {
        match coordinator.stop_recording(&camera_id) {
            Ok(Some(summary)) => println!(
                "{}: {} frames recorded, {} dropped -> {}",
                camera_id,
                summary.recorded_frame_count,
                summary.dropped_frame_count,
                summary.paths.metadata.display()
            ),
            Ok(None) => {}
            Err(e) => eprintln!("{}: recording failed: {}", camera_id, e),
        }
    }

    coordinator.shutdown();
    Ok(())
}

fn spawn_event_logger(events: crossbeam_channel::Receiver<CameraEvent>) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("camrig-events".into())
        .spawn(move || {
            for event in events.iter() {
                let json = serde_json::to_string(&event).unwrap_or_default();
                match event {
                    CameraEvent::FramesDropped { .. } => log::debug!("[Event] {}", json),
                    CameraEvent::DeviceFault { .. } => log::error!("[Event] {}", json),
                    _ => log::info!("[Event] {}", json),
                }
            }
        })?;
    Ok(())
}
