pub mod config;
mod dispatch;
pub mod event;
mod listener;
mod pipeline;
pub mod source;

pub use config::{ConfigStore, DevnodeFilter, MultipathConfig, UidAttrRule};
pub use dispatch::UeventTrigger;
pub use event::{DeviceHandle, RawUevent, Uevent};
pub use listener::{MAX_ACCUMULATION_COUNT, MAX_ACCUMULATION_TIME, MIN_BURST_SPEED};
pub use pipeline::UeventPipeline;
pub use source::{PollStatus, UeventSource};
