pub mod annotate;
pub mod dispatcher;
pub mod error;
pub mod ffmpeg;
pub mod frame_metrics;
pub mod image_analyzer;
pub mod queue;
pub mod registry;
pub mod staging;
pub mod supervisor;
pub mod video_analyzer;
pub mod worker;
