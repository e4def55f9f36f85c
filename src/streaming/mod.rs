//! PreviewStreamer (C9, spec §4.9): MJPEG and RTMP preview modes sharing
//! one overlay renderer and frame distribution mechanism.

pub mod frame_distributor;
pub mod mjpeg;
pub mod overlay;
pub mod rtmp;

pub use frame_distributor::FrameDistributor;
pub use mjpeg::{JpegEncoder, MjpegServer};
pub use overlay::{render as render_overlay, OverlayInput, SystemInfoOverlay};
pub use rtmp::{RtmpEncoder, RtmpState, RtmpStreamer};
