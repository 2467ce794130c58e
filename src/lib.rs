mod background;
mod detector;
mod frame;
mod monitor;
mod registry;
mod source;
mod status;

pub mod app;
pub mod config;

pub use app::{start_app, BayService, ServiceError};
pub use background::BackgroundModel;
pub use detector::{DetectionResult, OccupancyDetector};
pub use frame::{Frame, FrameError};
pub use monitor::{BayHandle, BayMonitor, CommandError};
pub use registry::StatusRegistry;
pub use source::{FrameSource, SimulatedConnector, SourceConnector, SourceError};
pub use status::{BaySnapshot, BayStatus};
