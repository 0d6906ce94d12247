use image::{Rgba, RgbaImage};
use projector::{CalibrationState, Projector, ProjectorConfig, VelocityCommand};
use rand::Rng;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Placeholder direction images: one solid color per steering intent.
const PLACEHOLDER_IMAGES: [(&str, [u8; 4]); 5] = [
    ("straight.png", [0xff, 0xff, 0xff, 0xff]),
    ("sharp_left.png", [0xff, 0x00, 0x00, 0xff]),
    ("sharp_right.png", [0x00, 0xff, 0x00, 0xff]),
    ("soft_left.png", [0x00, 0x00, 0xff, 0xff]),
    ("soft_right.png", [0xff, 0xff, 0x00, 0xff]),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Build a self-contained asset directory so the demo runs without any
    // robot-side calibration or artwork.
    let assets = tempfile::tempdir()?;
    let mut calibration = CalibrationState::default();
    calibration.translation.z = -3.0; // place the quad a few units ahead
    let calibration_path = assets.path().join("parameters.txt");
    calibration.save(&calibration_path)?;

    for (name, color) in PLACEHOLDER_IMAGES {
        RgbaImage::from_pixel(256, 256, Rgba(color)).save(assets.path().join(name))?;
    }

    let config = ProjectorConfig::builder()
        .title("simulated drive".to_string())
        .calibration_path(calibration_path)
        .texture_dir(assets.path().to_path_buf())
        .build();
    let projector = Projector::new(config)?;

    // Feed a wandering turn rate so the indicator cycles through all five
    // directions over time.
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut rng = rand::rng();
        let mut angular: f32 = 0.0;
        loop {
            angular = (angular + rng.random_range(-0.3..0.3)).clamp(-1.0, 1.0);
            let command = VelocityCommand {
                linear: 1.0,
                angular,
            };
            if sender.send(command).is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(400));
        }
    });

    println!("Projecting a simulated drive: the indicator follows a wandering turn rate.");
    println!("Keys: r/t pick rotate/translate, x/y/z pick the axis, arrows nudge, q quits.");
    projector.run(receiver)
}
