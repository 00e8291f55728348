use std::any::Any;
use std::fmt;
use std::ops::Range;

use tracing::{debug, trace, warn};

use crate::config::MultipathConfig;

/// Byte capacity of one event's property buffer, inherited from the
/// kernel hotplug protocol.
pub const HOTPLUG_BUFFER_SIZE: usize = 2048;
/// Upper bound on the number of properties carried by one event.
pub const HOTPLUG_NUM_ENVP: usize = 32;
/// Headroom on top of [`HOTPLUG_BUFFER_SIZE`] for oversized values.
pub const OBJECT_SIZE: usize = 512;

const DM_UUID_MPATH_PREFIX: &str = "mpath-";

/// Opaque reference to the source adapter's underlying device object.
///
/// Released exactly once: when the event that owns it is dropped, or when
/// construction fails and the raw notification is dropped.
pub type DeviceHandle = Box<dyn Any + Send>;

/// One kernel notification as produced by a source adapter, before the
/// listener turns it into a [`Uevent`].
pub struct RawUevent {
    properties: Vec<(String, String)>,
    device: Option<DeviceHandle>,
}

impl RawUevent {
    pub fn new(properties: Vec<(String, String)>) -> Self {
        Self {
            properties,
            device: None,
        }
    }

    pub fn with_device(mut self, device: DeviceHandle) -> Self {
        self.device = Some(device);
        self
    }

    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }
}

struct EnvEntry {
    name: Range<usize>,
    value: Range<usize>,
}

/// A block-device hotplug notification.
///
/// All properties live in one contiguous buffer; `devpath`, `action`,
/// `kernel`, and the resolved `wwid` are views into it. Once an event has
/// been handed to the pipeline, only `wwid` and `merged` still change, and
/// only on the dispatcher side.
pub struct Uevent {
    buffer: String,
    env: Vec<EnvEntry>,
    devpath: Range<usize>,
    action: Range<usize>,
    kernel: Range<usize>,
    wwid: Option<Range<usize>>,
    merged: Vec<Uevent>,
    device: Option<DeviceHandle>,
}

impl Uevent {
    /// Build an event from a raw notification.
    ///
    /// Properties are copied into the bounded buffer in order; copying
    /// stops at the byte or entry limit, keeping what was captured.
    /// Returns `None` when `DEVPATH` or `ACTION` is missing, dropping the
    /// device handle with the raw.
    pub fn from_raw(raw: RawUevent) -> Option<Self> {
        let RawUevent { properties, device } = raw;
        let mut buffer = String::new();
        let mut env = Vec::new();
        let mut devpath = None;
        let mut action = None;

        for (name, value) in &properties {
            if env.len() == HOTPLUG_NUM_ENVP - 1 {
                break;
            }
            if buffer.len() + name.len() + 1 + value.len() > HOTPLUG_BUFFER_SIZE + OBJECT_SIZE {
                warn!("uevent property buffer overflow, truncating env");
                break;
            }
            let name_start = buffer.len();
            buffer.push_str(name);
            let name_range = name_start..buffer.len();
            buffer.push('=');
            let value_start = buffer.len();
            buffer.push_str(value);
            let value_range = value_start..buffer.len();

            if name == "DEVPATH" {
                devpath = Some(value_range.clone());
            } else if name == "ACTION" {
                action = Some(value_range.clone());
            }
            env.push(EnvEntry {
                name: name_range,
                value: value_range,
            });
        }

        let (Some(devpath), Some(action)) = (devpath, action) else {
            debug!("uevent missing necessary fields, dropped");
            return None;
        };
        let kernel = match buffer[devpath.clone()].rfind('/') {
            Some(idx) => devpath.start + idx + 1..devpath.end,
            None => devpath.clone(),
        };
        trace!(
            action = &buffer[action.clone()],
            devpath = &buffer[devpath.clone()],
            "uevent received"
        );
        Some(Self {
            buffer,
            env,
            devpath,
            action,
            kernel,
            wwid: None,
            merged: Vec::new(),
            device,
        })
    }

    pub fn action(&self) -> &str {
        &self.buffer[self.action.clone()]
    }

    pub fn devpath(&self) -> &str {
        &self.buffer[self.devpath.clone()]
    }

    /// Trailing component of the device path, e.g. `sdb`.
    pub fn kernel(&self) -> &str {
        &self.buffer[self.kernel.clone()]
    }

    /// Stable logical-unit identifier, once the dispatcher has resolved it.
    pub fn wwid(&self) -> Option<&str> {
        self.wwid.clone().map(|range| &self.buffer[range])
    }

    /// Events absorbed into this one, in absorption order.
    pub fn merged(&self) -> &[Uevent] {
        &self.merged
    }

    /// Device-mapper events name the multipath devices themselves rather
    /// than physical paths; they are exempt from devnode filtering and
    /// from merging.
    pub fn is_dm(&self) -> bool {
        self.kernel().starts_with("dm-")
    }

    pub(crate) fn is_add(&self) -> bool {
        self.action() == "add"
    }

    pub(crate) fn is_change(&self) -> bool {
        self.action() == "change"
    }

    pub(crate) fn is_remove(&self) -> bool {
        self.action() == "remove"
    }

    /// Look up a property value.
    pub fn env(&self, name: &str) -> Option<&str> {
        if name.is_empty() {
            debug!("empty property name");
            return None;
        }
        self.env
            .iter()
            .find(|entry| &self.buffer[entry.name.clone()] == name)
            .map(|entry| &self.buffer[entry.value.clone()])
    }

    /// Parse a property as a non-negative integer. Absent, empty, or
    /// malformed values yield `None`.
    pub fn env_positive_int(&self, name: &str) -> Option<u64> {
        let value = self.env(name)?;
        if value.is_empty() {
            return None;
        }
        match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                debug!(name, value, "invalid integer property");
                None
            }
        }
    }

    /// Owned copy of a device-mapper property value.
    pub fn dm_str(&self, name: &str) -> Option<String> {
        self.env(name).map(str::to_owned)
    }

    /// True when `DM_UUID` marks this as a multipath device-mapper device.
    pub fn is_mpath(&self) -> bool {
        match self.env("DM_UUID") {
            Some(uuid) => {
                uuid.len() > DM_UUID_MPATH_PREFIX.len() && uuid.starts_with(DM_UUID_MPATH_PREFIX)
            }
            None => false,
        }
    }

    /// Resolve the wwid from the configuration's identifier rules for
    /// this kernel name. Leaves `wwid` unset when no rule matches or the
    /// event does not carry the keyed property.
    pub(crate) fn resolve_wwid(&mut self, config: &MultipathConfig) {
        let Some(key) = config.uid_attribute(self.kernel()) else {
            return;
        };
        if let Some(entry) = self
            .env
            .iter()
            .find(|entry| &self.buffer[entry.name.clone()] == key)
        {
            self.wwid = Some(entry.value.clone());
        }
    }

    pub(crate) fn absorb(&mut self, child: Uevent) {
        self.merged.push(child);
    }
}

impl fmt::Debug for Uevent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uevent")
            .field("action", &self.action())
            .field("devpath", &self.devpath())
            .field("wwid", &self.wwid())
            .field("merged", &self.merged.len())
            .finish()
    }
}
