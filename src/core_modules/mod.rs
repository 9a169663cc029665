pub mod actions;
pub mod automation;
pub mod frame;
pub mod frame_statistics;
pub mod motion_detector;
pub mod pixel;
pub mod rolling_window;
pub mod scale_search;
pub mod template_cache;
pub mod template_matcher;
pub mod utils;
