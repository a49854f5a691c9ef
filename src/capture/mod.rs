pub mod frame;
pub mod source;
pub mod test_pattern;

pub use frame::{EncodedFrame, OwnedFrame, OwnedPlane, PixelFormat, Plane, RawFrame};
pub use source::{push_source, FramePusher, FrameSource, PushSource};
pub use test_pattern::TestPatternSource;
