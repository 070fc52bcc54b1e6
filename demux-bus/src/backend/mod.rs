//! Engine and decoder implementations over real media libraries.

#[cfg(feature = "ffmpeg")]
mod ffmpeg;
#[cfg(feature = "symphonia")]
mod symphonia;

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::{FfmpegDecoderService, FfmpegEngine};
#[cfg(feature = "symphonia")]
pub use self::symphonia::{SymphoniaDecoderService, SymphoniaEngine};
