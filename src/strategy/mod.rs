// Pattern detection strategy
pub mod detector;
pub mod fvg;

pub use detector::{Detection, DetectorConfig, LiveUpdate, PatternDetector};
pub use fvg::detect_fvg;
