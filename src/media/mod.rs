//! Pipeline Architecture: file bytes are written into the demuxer, whose
//! frames are either handed out directly or piped through the decoder.
//!
//! Data Flow:
//! ```text
//! Input (file / memory) ──► chunks ──► Demuxer ──► FrameRecord ──┬─► caller
//!                                                                │
//!                                                   (decode) ────┴─► Decoder ──► AudioBuffer ──► caller
//! ```

#[allow(dead_code)]
pub mod pipe;
pub mod types;
