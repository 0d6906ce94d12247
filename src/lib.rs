// ============================================================================
// CRATE CONFIGURATION & IMPORTS
// ============================================================================

pub mod config;

// External crate imports
use glam::{Mat4, Vec3, Vec4};
use image::RgbaImage;
use log::{debug, error, info};
use pixels::{Pixels, SurfaceTexture};
use thiserror::Error;

// Standard library imports
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::time::Instant;

// Window management imports
use winit::dpi::LogicalSize;
use winit::event::{ElementState, Event, KeyEvent, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::WindowBuilder;

pub use config::ProjectorConfig;

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while loading or saving projector state.
#[derive(Debug, Error)]
pub enum ProjectorError {
    /// The calibration file could not be opened or read.
    #[error("cannot read calibration file {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The calibration file was read but its contents are not a valid
    /// calibration record.
    #[error("calibration file {path} is malformed: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    /// The calibration file could not be written.
    #[error("cannot write calibration file {path}: {source}")]
    ConfigSave {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A direction image is missing or undecodable.
    #[error("cannot load direction image {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

// ============================================================================
// DIRECTION CLASSIFICATION
// ============================================================================

/// A velocity command received from the drive system: forward speed and
/// turn rate. Consumed once on arrival, never stored.
#[derive(Debug, Clone, Copy)]
pub struct VelocityCommand {
    pub linear: f32,
    pub angular: f32,
}

/// The steering intent currently shown on the ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Straight,
    SharpLeft,
    SharpRight,
    SoftLeft,
    SoftRight,
}

impl Direction {
    /// Classifies a velocity command into a steering intent.
    ///
    /// Only forward motion is classified: for `linear <= 0` (reverse,
    /// stationary, or NaN) this returns `None` and the caller keeps the
    /// previously held direction. A turn rate inside `[-0.2, 0.2]` counts as
    /// straight; the band endpoints themselves classify as straight while
    /// `angular == ±0.5` already counts as a sharp turn.
    pub fn classify(linear: f32, angular: f32) -> Option<Self> {
        if linear <= 0.0 || linear.is_nan() {
            return None;
        }
        Some(if angular > -0.5 && angular < -0.2 {
            Self::SoftRight
        } else if angular > 0.2 && angular < 0.5 {
            Self::SoftLeft
        } else if angular <= -0.5 {
            Self::SharpRight
        } else if angular >= 0.5 {
            Self::SharpLeft
        } else {
            // NaN turn rates also land here
            Self::Straight
        })
    }

    /// Slot of this direction in the image set.
    fn index(self) -> usize {
        match self {
            Self::Straight => 0,
            Self::SharpLeft => 1,
            Self::SharpRight => 2,
            Self::SoftLeft => 3,
            Self::SoftRight => 4,
        }
    }
}

// ============================================================================
// CALIBRATION STATE
// ============================================================================

/// Which parameter class keyboard deltas currently edit.
///
/// Scale can be selected and is persisted with the rest of the state, but no
/// delta behavior is wired to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Rotate,
    Translate,
    Scale,
}

impl TransformMode {
    pub fn as_char(self) -> char {
        match self {
            Self::Rotate => 'r',
            Self::Translate => 't',
            Self::Scale => 's',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'r' => Some(Self::Rotate),
            't' => Some(Self::Translate),
            's' => Some(Self::Scale),
            _ => None,
        }
    }
}

/// Which component of the active parameter class deltas apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn as_char(self) -> char {
        match self {
            Self::X => 'x',
            Self::Y => 'y',
            Self::Z => 'z',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'x' => Some(Self::X),
            'y' => Some(Self::Y),
            'z' => Some(Self::Z),
            _ => None,
        }
    }
}

/// Direction of a keyboard edit (arrow up / arrow down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Increase,
    Decrease,
}

/// Degrees added or removed per rotation edit.
pub const ROTATION_STEP_DEGREES: f32 = 0.5;
/// World units added or removed per translation edit.
pub const TRANSLATION_STEP: f32 = 0.1;

/// Number of newline-separated fields in the calibration file.
const CALIBRATION_FIELD_COUNT: usize = 10;

/// The adjustable transform that maps the indicator quad onto the ground,
/// plus the currently selected edit mode and axis.
///
/// Loaded from disk at startup, edited through key events while running,
/// written back on shutdown.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
    /// Rotation around x, y, z in degrees.
    pub rotation_degrees: Vec3,
    /// Translation in world units.
    pub translation: Vec3,
    /// Near clipping distance. Must stay positive and below `far`.
    pub near: f32,
    /// Far clipping distance.
    pub far: f32,
    pub mode: TransformMode,
    pub axis: Axis,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            rotation_degrees: Vec3::ZERO,
            translation: Vec3::ZERO,
            near: 1.0,
            far: 100.0,
            mode: TransformMode::Rotate,
            axis: Axis::X,
        }
    }
}

impl CalibrationState {
    pub fn select_mode(&mut self, mode: TransformMode) {
        self.mode = mode;
    }

    pub fn select_axis(&mut self, axis: Axis) {
        self.axis = axis;
    }

    /// Applies one keyboard edit to the scalar selected by the active mode
    /// and axis. Rotation steps by 0.5 degrees, translation by 0.1 units;
    /// values are not clamped and may grow without bound.
    pub fn apply_delta(&mut self, delta: Delta) {
        let (target, step) = match self.mode {
            TransformMode::Rotate => (&mut self.rotation_degrees, ROTATION_STEP_DEGREES),
            TransformMode::Translate => (&mut self.translation, TRANSLATION_STEP),
            // selectable but has no edit behavior
            TransformMode::Scale => return,
        };
        let step = match delta {
            Delta::Increase => step,
            Delta::Decrease => -step,
        };
        match self.axis {
            Axis::X => target.x += step,
            Axis::Y => target.y += step,
            Axis::Z => target.z += step,
        }
    }

    /// The object transform for the indicator quad.
    ///
    /// Translation is applied before the rotations, and the rotations run in
    /// x, y, z order. Reordering either part moves the projected image.
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.translation)
            * Mat4::from_rotation_x(self.rotation_degrees.x.to_radians())
            * Mat4::from_rotation_y(self.rotation_degrees.y.to_radians())
            * Mat4::from_rotation_z(self.rotation_degrees.z.to_radians())
    }

    // ------------------------------------------------------------------
    // Persistence: a fixed-order, newline-separated text record of exactly
    // ten fields. No names, no version tag; floats use their shortest
    // round-trippable form so load(save(s)) == s.
    // ------------------------------------------------------------------

    /// Reads the calibration record at `path`.
    ///
    /// A file that cannot be opened yields [`ProjectorError::ConfigLoad`];
    /// a short file, an unparsable number, an unknown mode or axis letter,
    /// or a near/far pair that does not describe a valid frustum all yield
    /// [`ProjectorError::ConfigParse`].
    pub fn load(path: &Path) -> Result<Self, ProjectorError> {
        let text = fs::read_to_string(path).map_err(|source| ProjectorError::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |reason: String| ProjectorError::ConfigParse {
            path: path.to_path_buf(),
            reason,
        };

        let lines: Vec<&str> = text.lines().collect();
        if lines.len() < CALIBRATION_FIELD_COUNT {
            return Err(parse_error(format!(
                "expected {CALIBRATION_FIELD_COUNT} fields, found {}",
                lines.len()
            )));
        }

        let number = |index: usize, name: &str| -> Result<f32, ProjectorError> {
            lines[index]
                .trim()
                .parse::<f32>()
                .map_err(|_| parse_error(format!("field {name}: not a number: {:?}", lines[index])))
        };
        let letter = |index: usize, name: &str| -> Result<char, ProjectorError> {
            lines[index]
                .trim()
                .chars()
                .next()
                .ok_or_else(|| parse_error(format!("field {name} is empty")))
        };

        let state = Self {
            rotation_degrees: Vec3::new(
                number(0, "rotation x")?,
                number(1, "rotation y")?,
                number(2, "rotation z")?,
            ),
            translation: Vec3::new(
                number(3, "translation x")?,
                number(4, "translation y")?,
                number(5, "translation z")?,
            ),
            near: number(6, "near distance")?,
            far: number(7, "far distance")?,
            mode: letter(8, "transform mode").and_then(|c| {
                TransformMode::from_char(c)
                    .ok_or_else(|| parse_error(format!("unknown transform mode {c:?}")))
            })?,
            axis: letter(9, "axis").and_then(|c| {
                Axis::from_char(c).ok_or_else(|| parse_error(format!("unknown axis {c:?}")))
            })?,
        };

        if !(state.near > 0.0 && state.near < state.far) {
            return Err(parse_error(format!(
                "invalid frustum range: near {} far {}",
                state.near, state.far
            )));
        }

        Ok(state)
    }

    /// Writes the calibration record to `path`, truncating any existing file.
    pub fn save(&self, path: &Path) -> Result<(), ProjectorError> {
        let mut text = String::new();
        for value in [
            self.rotation_degrees.x,
            self.rotation_degrees.y,
            self.rotation_degrees.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.near,
            self.far,
        ] {
            text.push_str(&format!("{value}\n"));
        }
        text.push(self.mode.as_char());
        text.push('\n');
        text.push(self.axis.as_char());
        text.push('\n');

        fs::write(path, text).map_err(|source| ProjectorError::ConfigSave {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ============================================================================
// PERSPECTIVE PROJECTION
// ============================================================================

/// Symmetric frustum bounds equivalent to a vertical field of view plus an
/// aspect ratio at the given clipping distances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrustumBounds {
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
    pub top: f32,
    pub near: f32,
    pub far: f32,
}

/// Converts a perspective description into symmetric frustum bounds:
/// `h = tan(fov_y / 2) * near`, `w = h * aspect`.
pub fn frustum_bounds(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> FrustumBounds {
    let half_height = (fov_y_degrees.to_radians() / 2.0).tan() * near;
    let half_width = half_height * aspect;
    FrustumBounds {
        left: -half_width,
        right: half_width,
        bottom: -half_height,
        top: half_height,
        near,
        far,
    }
}

impl FrustumBounds {
    /// The perspective projection matrix for these bounds, mapping eye space
    /// (camera looking down -z) to clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let width = self.right - self.left;
        let height = self.top - self.bottom;
        let depth = self.far - self.near;
        Mat4::from_cols(
            Vec4::new(2.0 * self.near / width, 0.0, 0.0, 0.0),
            Vec4::new(0.0, 2.0 * self.near / height, 0.0, 0.0),
            Vec4::new(
                (self.right + self.left) / width,
                (self.top + self.bottom) / height,
                -(self.far + self.near) / depth,
                -1.0,
            ),
            Vec4::new(0.0, 0.0, -2.0 * self.far * self.near / depth, 0.0),
        )
    }
}

// ============================================================================
// DIRECTION IMAGE SET
// ============================================================================

/// File names of the five direction images, in [`Direction::index`] order.
const IMAGE_FILE_NAMES: [&str; 5] = [
    "straight.png",
    "sharp_left.png",
    "sharp_right.png",
    "soft_left.png",
    "soft_right.png",
];

/// The five decoded direction images. Populated once at startup and
/// immutable afterwards.
pub struct DirectionImages {
    images: [RgbaImage; 5],
}

impl DirectionImages {
    /// Loads all five images from `dir`. Any missing or undecodable image is
    /// fatal; the projector never runs with a partial set.
    pub fn load(dir: &Path) -> Result<Self, ProjectorError> {
        Ok(Self {
            images: [
                Self::load_one(dir, IMAGE_FILE_NAMES[0])?,
                Self::load_one(dir, IMAGE_FILE_NAMES[1])?,
                Self::load_one(dir, IMAGE_FILE_NAMES[2])?,
                Self::load_one(dir, IMAGE_FILE_NAMES[3])?,
                Self::load_one(dir, IMAGE_FILE_NAMES[4])?,
            ],
        })
    }

    fn load_one(dir: &Path, name: &str) -> Result<RgbaImage, ProjectorError> {
        let path = dir.join(name);
        let image = image::open(&path)
            .map_err(|source| ProjectorError::ImageLoad {
                path: path.clone(),
                source,
            })?
            .into_rgba8();
        debug!(
            "loaded {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(image)
    }

    #[cfg(test)]
    fn from_images(images: [RgbaImage; 5]) -> Self {
        Self { images }
    }

    /// Nearest-neighbor sample with clamped texture coordinates. Image rows
    /// run top to bottom while the quad's v axis runs bottom to top, so v is
    /// flipped here instead of flipping every image at load time.
    fn sample(&self, direction: Direction, u: f32, v: f32) -> [u8; 4] {
        let image = &self.images[direction.index()];
        let x = (u.clamp(0.0, 1.0) * (image.width() - 1) as f32).round() as u32;
        let y = ((1.0 - v.clamp(0.0, 1.0)) * (image.height() - 1) as f32).round() as u32;
        image.get_pixel(x, y).0
    }
}

// ============================================================================
// SOFTWARE RASTERIZER
// ============================================================================

struct Canvas<'a> {
    frame: &'a mut [u8],
    width: usize,
    height: usize,
}

impl<'a> Canvas<'a> {
    fn new(frame: &'a mut [u8], width: usize, height: usize) -> Self {
        Self {
            frame,
            width,
            height,
        }
    }

    fn clear(&mut self, color: (u8, u8, u8)) {
        for chunk in self.frame.chunks_exact_mut(4) {
            chunk.copy_from_slice(&[color.0, color.1, color.2, 0xff]);
        }
    }
}

fn set_pixel(frame: &mut [u8], width: usize, x: usize, y: usize, r: u8, g: u8, b: u8, alpha: f32) {
    if x < width && y < frame.len() / (width * 4) {
        let idx = (y * width + x) * 4;
        let src = [r as f32, g as f32, b as f32, 255.0 * alpha];
        let dst = [
            frame[idx] as f32,
            frame[idx + 1] as f32,
            frame[idx + 2] as f32,
            frame[idx + 3] as f32,
        ];
        let a = src[3] / 255.0;
        let out = [
            (src[0] * a + dst[0] * (1.0 - a)).round() as u8,
            (src[1] * a + dst[1] * (1.0 - a)).round() as u8,
            (src[2] * a + dst[2] * (1.0 - a)).round() as u8,
            0xff,
        ];
        frame[idx..idx + 4].copy_from_slice(&out);
    }
}

/// A quad corner after projection: screen position plus the attributes
/// needed for perspective-correct texturing (u/w, v/w, 1/w).
#[derive(Debug, Clone, Copy, Default)]
struct ScreenVertex {
    x: f32,
    y: f32,
    u_over_w: f32,
    v_over_w: f32,
    inv_w: f32,
}

/// The unit-sized image plane, centered on the view axis, with the texture's
/// v origin at the bottom-left corner.
const QUAD: [([f32; 3], [f32; 2]); 4] = [
    ([-1.0, -1.0, 0.0], [0.0, 0.0]),
    ([1.0, -1.0, 0.0], [1.0, 0.0]),
    ([1.0, 1.0, 0.0], [1.0, 1.0]),
    ([-1.0, 1.0, 0.0], [0.0, 1.0]),
];

/// Renders one frame: clears to black, projects the indicator quad through
/// the calibration transform and frustum, and rasterizes it with the image
/// bound to `direction`.
fn render_frame(
    canvas: &mut Canvas,
    direction: Direction,
    calibration: &CalibrationState,
    frustum: &FrustumBounds,
    images: &DirectionImages,
) {
    canvas.clear((0x00, 0x00, 0x00));
    if canvas.width == 0 || canvas.height == 0 {
        return;
    }

    let mvp = frustum.projection_matrix() * calibration.model_matrix();
    let mut vertices = [ScreenVertex::default(); 4];
    for (vertex, (position, uv)) in vertices.iter_mut().zip(QUAD) {
        let clip = mvp * Vec4::new(position[0], position[1], position[2], 1.0);
        if clip.w <= 0.0 {
            // a corner at or behind the eye; skip the whole quad rather
            // than clip it, matching how far the calibration is ever pushed
            return;
        }
        let inv_w = 1.0 / clip.w;
        *vertex = ScreenVertex {
            x: (clip.x * inv_w + 1.0) * 0.5 * canvas.width as f32,
            y: (1.0 - clip.y * inv_w) * 0.5 * canvas.height as f32,
            u_over_w: uv[0] * inv_w,
            v_over_w: uv[1] * inv_w,
            inv_w,
        };
    }

    let sample = |u: f32, v: f32| images.sample(direction, u, v);
    fill_textured_triangle(canvas, [vertices[0], vertices[1], vertices[2]], &sample);
    fill_textured_triangle(canvas, [vertices[0], vertices[2], vertices[3]], &sample);
}

fn edge(ax: f32, ay: f32, bx: f32, by: f32, px: f32, py: f32) -> f32 {
    (bx - ax) * (py - ay) - (by - ay) * (px - ax)
}

fn fill_textured_triangle(
    canvas: &mut Canvas,
    tri: [ScreenVertex; 3],
    sample: &impl Fn(f32, f32) -> [u8; 4],
) {
    let [a, b, c] = tri;
    let area = edge(a.x, a.y, b.x, b.y, c.x, c.y);
    if area.abs() < f32::EPSILON {
        return;
    }

    let min_x = a.x.min(b.x).min(c.x).floor().max(0.0) as i32;
    let max_x = a.x.max(b.x).max(c.x).ceil().min((canvas.width - 1) as f32) as i32;
    let min_y = a.y.min(b.y).min(c.y).floor().max(0.0) as i32;
    let max_y = a.y.max(b.y).max(c.y).ceil().min((canvas.height - 1) as f32) as i32;

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            // normalized barycentric weights; dividing by the signed area
            // makes the inside test independent of winding order
            let wa = edge(b.x, b.y, c.x, c.y, px, py) / area;
            let wb = edge(c.x, c.y, a.x, a.y, px, py) / area;
            let wc = edge(a.x, a.y, b.x, b.y, px, py) / area;
            if wa < 0.0 || wb < 0.0 || wc < 0.0 {
                continue;
            }

            let inv_w = wa * a.inv_w + wb * b.inv_w + wc * c.inv_w;
            if inv_w <= 0.0 {
                continue;
            }
            let u = (wa * a.u_over_w + wb * b.u_over_w + wc * c.u_over_w) / inv_w;
            let v = (wa * a.v_over_w + wb * b.v_over_w + wc * c.v_over_w) / inv_w;

            let [r, g, bl, alpha] = sample(u, v);
            if alpha > 0 {
                set_pixel(
                    canvas.frame,
                    canvas.width,
                    x as usize,
                    y as usize,
                    r,
                    g,
                    bl,
                    alpha as f32 / 255.0,
                );
            }
        }
    }
}

// ============================================================================
// PUBLIC API - PROJECTOR RUN LOOP
// ============================================================================

/// The projector application: owns the calibration state, the current
/// direction, and the direction image set, and drives the window loop.
pub struct Projector {
    config: ProjectorConfig,
    calibration: CalibrationState,
    direction: Direction,
    images: DirectionImages,
}

impl Projector {
    /// Loads calibration and direction images. Both are required to present
    /// anything meaningful, so either failing is fatal.
    pub fn new(config: ProjectorConfig) -> Result<Self, ProjectorError> {
        let calibration = CalibrationState::load(&config.calibration_path)?;
        info!(
            "calibration loaded from {}",
            config.calibration_path.display()
        );
        let images = DirectionImages::load(&config.texture_dir)?;
        info!(
            "loaded {} direction images from {}",
            IMAGE_FILE_NAMES.len(),
            config.texture_dir.display()
        );
        Ok(Self {
            config,
            calibration,
            direction: Direction::Straight,
            images,
        })
    }

    /// Runs the window loop until the quit key is pressed or the window is
    /// closed, consuming velocity commands from `commands`.
    ///
    /// All state lives on this thread. The command channel is drained with
    /// `try_recv` on a fixed cadence so a silent channel never stalls input
    /// or redraws, and every state change requests a redraw. On shutdown the
    /// calibration is flushed to disk before the surface is released; a
    /// failed flush is logged but does not block exit.
    pub fn run(
        mut self,
        commands: Receiver<VelocityCommand>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let event_loop = EventLoop::new()?;
        let window = WindowBuilder::new()
            .with_title(&self.config.title)
            .with_inner_size(LogicalSize::new(
                self.config.window_width as f64,
                self.config.window_height as f64,
            ))
            .with_resizable(false)
            .build(&event_loop)?;
        let window = std::sync::Arc::new(window);
        let window_clone = window.clone();

        let size = window.inner_size();
        let mut fb_width = size.width as usize;
        let mut fb_height = size.height as usize;
        let surface_texture = SurfaceTexture::new(size.width, size.height, &window);
        let mut pixels = Pixels::new(size.width, size.height, surface_texture)?;

        // The projection is fixed at startup: configured aspect ratio plus
        // the calibrated clipping distances. Resizes only move the viewport.
        let frustum = frustum_bounds(
            self.config.fov_y_degrees,
            self.config.aspect_ratio(),
            self.calibration.near,
            self.calibration.far,
        );
        info!("frustum bounds: {frustum:?}");

        let poll_interval = self.config.command_poll_interval;
        let calibration_path = self.config.calibration_path.clone();
        let mut last_poll = Instant::now();
        let mut drawn_once = false;

        event_loop.run(move |event, window_target| {
            window_target.set_control_flow(ControlFlow::WaitUntil(last_poll + poll_interval));
            match event {
                Event::WindowEvent { event, .. } => match event {
                    WindowEvent::CloseRequested => {
                        flush_calibration(&self.calibration, &calibration_path);
                        window_target.exit();
                    }
                    WindowEvent::Resized(new_size) => {
                        fb_width = new_size.width as usize;
                        fb_height = new_size.height as usize;
                        let _ = pixels.resize_buffer(new_size.width, new_size.height);
                        let _ = pixels.resize_surface(new_size.width, new_size.height);
                        window_clone.request_redraw();
                    }
                    WindowEvent::KeyboardInput {
                        event:
                            KeyEvent {
                                physical_key: PhysicalKey::Code(code),
                                state: ElementState::Pressed,
                                ..
                            },
                        ..
                    } => match code {
                        KeyCode::KeyR => self.calibration.select_mode(TransformMode::Rotate),
                        KeyCode::KeyT => self.calibration.select_mode(TransformMode::Translate),
                        KeyCode::KeyS => self.calibration.select_mode(TransformMode::Scale),
                        KeyCode::KeyX => self.calibration.select_axis(Axis::X),
                        KeyCode::KeyY => self.calibration.select_axis(Axis::Y),
                        KeyCode::KeyZ => self.calibration.select_axis(Axis::Z),
                        KeyCode::ArrowUp => {
                            self.calibration.apply_delta(Delta::Increase);
                            window_clone.request_redraw();
                        }
                        KeyCode::ArrowDown => {
                            self.calibration.apply_delta(Delta::Decrease);
                            window_clone.request_redraw();
                        }
                        KeyCode::KeyQ => {
                            flush_calibration(&self.calibration, &calibration_path);
                            window_target.exit();
                        }
                        _ => {}
                    },
                    WindowEvent::RedrawRequested => {
                        let frame = pixels.frame_mut();
                        let mut canvas = Canvas::new(frame, fb_width, fb_height);
                        render_frame(
                            &mut canvas,
                            self.direction,
                            &self.calibration,
                            &frustum,
                            &self.images,
                        );
                        if let Err(err) = pixels.render() {
                            error!("frame present failed: {err}");
                        }
                    }
                    _ => {}
                },
                Event::AboutToWait => {
                    if !drawn_once {
                        drawn_once = true;
                        window_clone.request_redraw();
                    }
                    if last_poll.elapsed() >= poll_interval {
                        last_poll = Instant::now();
                        let mut classified = false;
                        while let Ok(command) = commands.try_recv() {
                            if let Some(direction) =
                                Direction::classify(command.linear, command.angular)
                            {
                                debug!(
                                    "linear {} angular {} -> {direction:?}",
                                    command.linear, command.angular
                                );
                                self.direction = direction;
                                classified = true;
                            }
                        }
                        if classified {
                            window_clone.request_redraw();
                        }
                    }
                }
                _ => {}
            }
        })?;

        Ok(())
    }
}

/// Best-effort write of the calibration state during shutdown. State loss is
/// acceptable at this point, so failures are only logged.
fn flush_calibration(calibration: &CalibrationState, path: &Path) {
    match calibration.save(path) {
        Ok(()) => info!("calibration saved to {}", path.display()),
        Err(err) => error!("calibration not saved: {err}"),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgba;
    use tempfile::tempdir;

    // ------------------------------------------------------------------
    // Direction classification
    // ------------------------------------------------------------------

    #[test]
    fn small_turn_rates_classify_as_straight() {
        for angular in [0.0, 0.1, -0.1, 0.19, -0.19] {
            assert_eq!(
                Direction::classify(1.0, angular),
                Some(Direction::Straight),
                "angular {angular}"
            );
        }
    }

    #[test]
    fn soft_turn_bands_are_open_intervals() {
        for angular in [0.21, 0.3, 0.49] {
            assert_eq!(Direction::classify(1.0, angular), Some(Direction::SoftLeft));
            assert_eq!(
                Direction::classify(1.0, -angular),
                Some(Direction::SoftRight)
            );
        }
    }

    #[test]
    fn sharp_turns_start_at_half() {
        for angular in [0.5, 0.7, 3.0] {
            assert_eq!(
                Direction::classify(1.0, angular),
                Some(Direction::SharpLeft)
            );
            assert_eq!(
                Direction::classify(1.0, -angular),
                Some(Direction::SharpRight)
            );
        }
    }

    #[test]
    fn band_edges_fall_back_to_straight() {
        assert_eq!(Direction::classify(1.0, 0.2), Some(Direction::Straight));
        assert_eq!(Direction::classify(1.0, -0.2), Some(Direction::Straight));
    }

    #[test]
    fn non_forward_motion_is_not_classified() {
        assert_eq!(Direction::classify(0.0, 0.9), None);
        assert_eq!(Direction::classify(-0.5, 0.9), None);
        assert_eq!(Direction::classify(f32::NAN, 0.9), None);
    }

    #[test]
    fn non_finite_turn_rates_use_comparison_fallthrough() {
        assert_eq!(
            Direction::classify(1.0, f32::NAN),
            Some(Direction::Straight)
        );
        assert_eq!(
            Direction::classify(1.0, f32::INFINITY),
            Some(Direction::SharpLeft)
        );
        assert_eq!(
            Direction::classify(1.0, f32::NEG_INFINITY),
            Some(Direction::SharpRight)
        );
    }

    #[test]
    fn reverse_commands_hold_the_previous_direction() {
        let mut direction = Direction::Straight;
        let commands = [
            (1.0, 0.6, Direction::SharpLeft),
            (1.0, -0.1, Direction::Straight),
            (-0.5, 0.9, Direction::Straight),
        ];
        for (linear, angular, expected) in commands {
            if let Some(update) = Direction::classify(linear, angular) {
                direction = update;
            }
            assert_eq!(direction, expected, "after ({linear}, {angular})");
        }
    }

    // ------------------------------------------------------------------
    // Calibration state machine
    // ------------------------------------------------------------------

    #[test]
    fn delta_moves_only_the_selected_scalar() {
        let cases = [
            (TransformMode::Rotate, ROTATION_STEP_DEGREES),
            (TransformMode::Translate, TRANSLATION_STEP),
        ];
        for (mode, step) in cases {
            for axis in [Axis::X, Axis::Y, Axis::Z] {
                let mut state = CalibrationState::default();
                state.select_mode(mode);
                state.select_axis(axis);
                state.apply_delta(Delta::Increase);

                let (edited, untouched) = match mode {
                    TransformMode::Rotate => (state.rotation_degrees, state.translation),
                    _ => (state.translation, state.rotation_degrees),
                };
                let expected = match axis {
                    Axis::X => Vec3::new(step, 0.0, 0.0),
                    Axis::Y => Vec3::new(0.0, step, 0.0),
                    Axis::Z => Vec3::new(0.0, 0.0, step),
                };
                assert_eq!(edited, expected, "{mode:?} {axis:?}");
                assert_eq!(untouched, Vec3::ZERO, "{mode:?} {axis:?}");
            }
        }
    }

    #[test]
    fn increase_then_decrease_restores_the_scalar() {
        let mut state = CalibrationState::default();
        state.select_mode(TransformMode::Translate);
        state.select_axis(Axis::Z);
        state.apply_delta(Delta::Increase);
        state.apply_delta(Delta::Decrease);
        assert_eq!(state.translation.z, 0.0);

        state.select_mode(TransformMode::Rotate);
        state.select_axis(Axis::Z);
        state.rotation_degrees.z = 0.25;
        state.apply_delta(Delta::Decrease);
        state.apply_delta(Delta::Increase);
        assert_eq!(state.rotation_degrees.z, 0.25);
    }

    #[test]
    fn scale_mode_deltas_are_a_noop() {
        let mut state = CalibrationState::default();
        state.select_mode(TransformMode::Scale);
        let before = state.clone();
        state.apply_delta(Delta::Increase);
        state.apply_delta(Delta::Decrease);
        assert_eq!(state, before);
    }

    #[test]
    fn mode_and_axis_letters_round_trip() {
        for mode in [
            TransformMode::Rotate,
            TransformMode::Translate,
            TransformMode::Scale,
        ] {
            assert_eq!(TransformMode::from_char(mode.as_char()), Some(mode));
        }
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            assert_eq!(Axis::from_char(axis.as_char()), Some(axis));
        }
        assert_eq!(TransformMode::from_char('w'), None);
        assert_eq!(Axis::from_char('q'), None);
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn sample_state() -> CalibrationState {
        CalibrationState {
            rotation_degrees: Vec3::new(12.5, -3.0, 0.1),
            translation: Vec3::new(0.3, -1.7, -2.5),
            near: 0.5,
            far: 80.0,
            mode: TransformMode::Translate,
            axis: Axis::Z,
        }
    }

    #[test]
    fn calibration_survives_a_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.txt");
        let state = sample_state();
        state.save(&path).unwrap();
        assert_eq!(CalibrationState::load(&path).unwrap(), state);
    }

    #[test]
    fn saved_record_has_ten_ordered_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.txt");
        sample_state().save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "12.5");
        assert_eq!(lines[6], "0.5");
        assert_eq!(lines[8], "t");
        assert_eq!(lines[9], "z");
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let dir = tempdir().unwrap();
        let err = CalibrationState::load(&dir.path().join("nope.txt")).unwrap_err();
        assert!(matches!(err, ProjectorError::ConfigLoad { .. }), "{err}");
    }

    #[test]
    fn short_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.txt");
        std::fs::write(&path, "1\n2\n3\n4\n").unwrap();
        let err = CalibrationState::load(&path).unwrap_err();
        assert!(matches!(err, ProjectorError::ConfigParse { .. }), "{err}");
    }

    #[test]
    fn garbage_number_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.txt");
        std::fs::write(&path, "0\n0\n0\n0\n0\n0\nhello\n100\nr\nx\n").unwrap();
        let err = CalibrationState::load(&path).unwrap_err();
        assert!(matches!(err, ProjectorError::ConfigParse { .. }), "{err}");
    }

    #[test]
    fn unknown_mode_letter_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.txt");
        std::fs::write(&path, "0\n0\n0\n0\n0\n0\n1\n100\nw\nx\n").unwrap();
        let err = CalibrationState::load(&path).unwrap_err();
        assert!(matches!(err, ProjectorError::ConfigParse { .. }), "{err}");
    }

    #[test]
    fn inverted_clip_range_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.txt");
        std::fs::write(&path, "0\n0\n0\n0\n0\n0\n100\n1\nr\nx\n").unwrap();
        let err = CalibrationState::load(&path).unwrap_err();
        assert!(matches!(err, ProjectorError::ConfigParse { .. }), "{err}");
    }

    // ------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------

    #[test]
    fn frustum_bounds_match_the_symmetric_perspective() {
        let bounds = frustum_bounds(60.0, 1280.0 / 800.0, 1.0, 100.0);
        assert_relative_eq!(bounds.top, 0.577_350_3, epsilon = 1e-5);
        assert_relative_eq!(bounds.right, 0.923_760_4, epsilon = 1e-5);
        assert_eq!(bounds.left, -bounds.right);
        assert_eq!(bounds.bottom, -bounds.top);
        assert_eq!(bounds.near, 1.0);
        assert_eq!(bounds.far, 100.0);
    }

    #[test]
    fn projection_maps_near_plane_corners_to_ndc_corners() {
        let bounds = frustum_bounds(60.0, 1.6, 1.0, 100.0);
        let clip =
            bounds.projection_matrix() * Vec4::new(bounds.right, bounds.top, -bounds.near, 1.0);
        let ndc = clip / clip.w;
        assert_relative_eq!(ndc.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(ndc.y, 1.0, epsilon = 1e-5);
        assert_relative_eq!(ndc.z, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn model_matrix_translates_before_rotating() {
        let mut state = CalibrationState::default();
        state.rotation_degrees.z = 90.0;
        state.translation.x = 1.0;
        // rotate (1,0,0) to (0,1,0) first, then shift by (1,0,0)
        let point = state
            .model_matrix()
            .transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(point.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(point.y, 1.0, epsilon = 1e-5);
        assert_relative_eq!(point.z, 0.0, epsilon = 1e-5);
    }

    // ------------------------------------------------------------------
    // Rasterizer
    // ------------------------------------------------------------------

    fn solid(color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(8, 8, Rgba(color))
    }

    fn test_images() -> DirectionImages {
        DirectionImages::from_images([
            solid([0xff, 0xff, 0xff, 0xff]), // straight
            solid([0xff, 0x00, 0x00, 0xff]), // sharp left
            solid([0x00, 0xff, 0x00, 0xff]), // sharp right
            solid([0x00, 0x00, 0xff, 0xff]), // soft left
            solid([0xff, 0xff, 0x00, 0xff]), // soft right
        ])
    }

    fn center_pixel(frame: &[u8], width: usize, height: usize) -> [u8; 4] {
        let idx = ((height / 2) * width + width / 2) * 4;
        [frame[idx], frame[idx + 1], frame[idx + 2], frame[idx + 3]]
    }

    #[test]
    fn rendered_quad_shows_the_selected_direction_image() {
        let images = test_images();
        let frustum = frustum_bounds(60.0, 1.0, 1.0, 100.0);
        let mut calibration = CalibrationState::default();
        calibration.translation.z = -2.0;

        for (direction, color) in [
            (Direction::SharpLeft, [0xff, 0x00, 0x00, 0xff]),
            (Direction::SoftLeft, [0x00, 0x00, 0xff, 0xff]),
        ] {
            let mut frame = vec![0u8; 64 * 64 * 4];
            let mut canvas = Canvas::new(&mut frame, 64, 64);
            render_frame(&mut canvas, direction, &calibration, &frustum, &images);
            assert_eq!(center_pixel(&frame, 64, 64), color, "{direction:?}");
        }
    }

    #[test]
    fn quad_behind_the_eye_draws_nothing() {
        let images = test_images();
        let frustum = frustum_bounds(60.0, 1.0, 1.0, 100.0);
        let mut calibration = CalibrationState::default();
        calibration.translation.z = 5.0;

        let mut frame = vec![0u8; 64 * 64 * 4];
        let mut canvas = Canvas::new(&mut frame, 64, 64);
        render_frame(
            &mut canvas,
            Direction::Straight,
            &calibration,
            &frustum,
            &images,
        );
        assert_eq!(center_pixel(&frame, 64, 64), [0x00, 0x00, 0x00, 0xff]);
    }
}
