use bon::Builder;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the projector window, projection and asset locations.
///
/// Built with the bon-generated builder; every field has a default matching
/// the projector hardware this was written for (a 1280x800 unit mounted on
/// the robot, 60 degree vertical field of view).
#[derive(Debug, Clone, Builder)]
pub struct ProjectorConfig {
    #[builder(default = "projector".to_string())]
    pub title: String,

    // Window configuration (native resolution of the projector)
    #[builder(default = 1280)]
    pub window_width: u32,
    #[builder(default = 800)]
    pub window_height: u32,

    /// Vertical field of view of the camera model, in degrees.
    #[builder(default = 60.0)]
    pub fov_y_degrees: f32,

    /// Path of the plain-text calibration file loaded at startup and
    /// rewritten on shutdown.
    #[builder(default = PathBuf::from("parameters.txt"))]
    pub calibration_path: PathBuf,

    /// Directory holding the five direction images (straight.png,
    /// sharp_left.png, sharp_right.png, soft_left.png, soft_right.png).
    #[builder(default = PathBuf::from("textures"))]
    pub texture_dir: PathBuf,

    /// How often the inbound velocity-command channel is drained.
    #[builder(default = Duration::from_millis(500))]
    pub command_poll_interval: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ProjectorConfig {
    /// Aspect ratio of the configured window.
    ///
    /// The projection keeps this ratio even if the surface is later resized;
    /// resizing only changes the viewport.
    pub fn aspect_ratio(&self) -> f32 {
        self.window_width as f32 / self.window_height as f32
    }
}
