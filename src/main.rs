use log::{error, info, warn};
use projector::{CalibrationState, Projector, ProjectorConfig, VelocityCommand};
use std::env;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::thread;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line options
    let mut calibration_path: Option<PathBuf> = None;
    let mut texture_dir: Option<PathBuf> = None;
    let mut window_title: Option<String> = None;
    let mut write_defaults = false;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--calibration" => calibration_path = args.next().map(PathBuf::from),
            "--textures" => texture_dir = args.next().map(PathBuf::from),
            "--title" => window_title = args.next(),
            "--init" => write_defaults = true,
            other => {
                warn!("ignoring unknown argument {other:?}");
            }
        }
    }

    let config = ProjectorConfig::builder()
        .maybe_calibration_path(calibration_path)
        .maybe_texture_dir(texture_dir)
        .maybe_title(window_title)
        .build();

    // First-run helper: write a default calibration file and stop, since a
    // missing file is otherwise fatal at startup.
    if write_defaults {
        match CalibrationState::default().save(&config.calibration_path) {
            Ok(()) => info!(
                "wrote default calibration to {}",
                config.calibration_path.display()
            ),
            Err(err) => {
                error!("{err}");
                process::exit(1);
            }
        }
        return;
    }

    let projector = match Projector::new(config) {
        Ok(projector) => projector,
        Err(err) => {
            error!("startup failed: {err}");
            process::exit(1);
        }
    };

    // Velocity commands arrive as "<linear> <angular>" lines on stdin.
    // Anything unparsable is dropped; the classifier holds the previous
    // direction when no valid command arrives.
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let mut fields = line.split_whitespace();
            let (Some(linear), Some(angular)) = (fields.next(), fields.next()) else {
                continue;
            };
            let (Ok(linear), Ok(angular)) = (linear.parse::<f32>(), angular.parse::<f32>()) else {
                continue;
            };
            if sender.send(VelocityCommand { linear, angular }).is_err() {
                break;
            }
        }
    });

    if let Err(err) = projector.run(receiver) {
        error!("projector stopped: {err}");
        process::exit(1);
    }
}
