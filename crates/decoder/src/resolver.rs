//! Device discovery: find the video node whose driver matches, open it and
//! validate its capabilities.
//!
//! The class directory (normally `/sys/class/video4linux`) holds one entry
//! per node. Each entry carries a `name` file with the driver name and is a
//! symlink whose basename is the node's name under the device directory.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use m2m_common::{DecoderConfig, SessionError, SessionResult};
use tracing::{debug, info, warn};

use crate::v4l2::ffi::{
    V4L2_CAP_STREAMING, V4L2_CAP_VIDEO_CAPTURE_MPLANE, V4L2_CAP_VIDEO_M2M_MPLANE,
    V4L2_CAP_VIDEO_OUTPUT_MPLANE,
};
use crate::v4l2::{Capabilities, KernelDevice, VideoDevice};

/// Capability set a node must expose to be accepted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// Memory-to-memory: both queues plus streaming.
    M2m,
    /// An output (display) node with streaming.
    OutputOnly,
}

impl DeviceKind {
    pub fn accepts(self, caps: &Capabilities) -> bool {
        let c = caps.effective();
        let has = |bits: u32| c & bits == bits;
        match self {
            Self::M2m => {
                has(V4L2_CAP_VIDEO_M2M_MPLANE)
                    || has(
                        V4L2_CAP_VIDEO_CAPTURE_MPLANE
                            | V4L2_CAP_VIDEO_OUTPUT_MPLANE
                            | V4L2_CAP_STREAMING,
                    )
            }
            Self::OutputOnly => has(V4L2_CAP_VIDEO_OUTPUT_MPLANE | V4L2_CAP_STREAMING),
        }
    }
}

/// Driver-name matcher: every needle must occur in the name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverPattern {
    needles: Vec<String>,
}

impl DriverPattern {
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needles: vec![needle.into()],
        }
    }

    pub fn all_of<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            needles: needles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, driver: &str) -> bool {
        self.needles.iter().all(|n| driver.contains(n.as_str()))
    }
}

impl fmt::Display for DriverPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.needles.join("+"))
    }
}

/// One enumerated video node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoNode {
    /// Entry name in the class directory, e.g. `video6`.
    pub name: String,
    /// Driver name read from the entry's `name` file.
    pub driver: String,
    /// Device special file the entry resolves to.
    pub device_path: PathBuf,
}

/// Enumerates and opens video nodes.
#[derive(Clone, Debug)]
pub struct DeviceResolver {
    class_dir: PathBuf,
    dev_dir: PathBuf,
}

impl DeviceResolver {
    pub fn new(class_dir: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            class_dir: class_dir.into(),
            dev_dir: dev_dir.into(),
        }
    }

    pub fn from_config(config: &DecoderConfig) -> Self {
        Self::new(&config.sysfs_dir, &config.dev_dir)
    }

    /// All `video*` entries with a readable driver name and a resolvable
    /// device path, sorted by entry name. Entries failing either lookup are
    /// skipped.
    pub fn nodes(&self) -> io::Result<Vec<VideoNode>> {
        let mut nodes = Vec::new();
        for entry in fs::read_dir(&self.class_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("video") {
                continue;
            }

            let Some(driver) = read_driver_name(&entry.path()) else {
                debug!(entry = %name, "No readable driver name, skipping");
                continue;
            };
            let device_path = match fs::read_link(entry.path()) {
                Ok(target) => match target.file_name() {
                    Some(base) => self.dev_dir.join(base),
                    None => continue,
                },
                Err(e) => {
                    debug!(entry = %name, error = %e, "Entry is not a link, skipping");
                    continue;
                }
            };
            nodes.push(VideoNode {
                name,
                driver,
                device_path,
            });
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    /// Nodes whose driver name matches `pattern`, in enumeration order.
    pub fn candidates(&self, pattern: &DriverPattern) -> io::Result<Vec<VideoNode>> {
        Ok(self
            .nodes()?
            .into_iter()
            .filter(|n| pattern.matches(&n.driver))
            .collect())
    }

    /// Device path of the first node whose driver matches, without opening it.
    pub fn find_device(&self, pattern: &DriverPattern) -> SessionResult<PathBuf> {
        self.candidates(pattern)
            .ok()
            .and_then(|c| c.into_iter().next())
            .map(|n| n.device_path)
            .ok_or_else(|| SessionError::DeviceNotFound {
                driver: pattern.to_string(),
            })
    }

    /// Open the first matching node that passes capability validation.
    ///
    /// Rejected candidates are closed before the next one is tried.
    pub fn open_with<D, F>(
        &self,
        pattern: &DriverPattern,
        kind: DeviceKind,
        mut open: F,
    ) -> SessionResult<D>
    where
        D: VideoDevice,
        F: FnMut(&Path) -> io::Result<D>,
    {
        let candidates = self.candidates(pattern).unwrap_or_else(|e| {
            warn!(dir = %self.class_dir.display(), error = %e, "Cannot enumerate video nodes");
            Vec::new()
        });

        for node in candidates {
            let device = match open(&node.device_path) {
                Ok(device) => device,
                Err(e) => {
                    warn!(device = %node.device_path.display(), error = %e, "Open failed");
                    continue;
                }
            };
            match device.query_caps() {
                Ok(caps) if kind.accepts(&caps) => {
                    info!(
                        device = %node.device_path.display(),
                        driver = %node.driver,
                        card = %caps.card,
                        ?kind,
                        "Found device"
                    );
                    return Ok(device);
                }
                Ok(caps) => debug!(
                    device = %node.device_path.display(),
                    caps = format_args!("0x{:08x}", caps.effective()),
                    ?kind,
                    "Capabilities rejected"
                ),
                Err(e) => warn!(
                    device = %node.device_path.display(),
                    error = %e,
                    "VIDIOC_QUERYCAP failed"
                ),
            }
        }

        Err(SessionError::DeviceNotFound {
            driver: pattern.to_string(),
        })
    }

    pub fn open(&self, pattern: &DriverPattern, kind: DeviceKind) -> SessionResult<KernelDevice> {
        self.open_with(pattern, kind, KernelDevice::open)
    }

    /// Look for the decoder, the color converter and the display node in
    /// one pass. Every handle opened along the way is closed on return.
    pub fn probe_with<D, F>(&self, mut open: F) -> io::Result<ProbeReport>
    where
        D: VideoDevice,
        F: FnMut(&Path) -> io::Result<D>,
    {
        let mut report = ProbeReport::default();
        for node in self.nodes()? {
            let Some(role) = Role::ALL
                .into_iter()
                .find(|r| report.get(*r).is_none() && r.pattern().matches(&node.driver))
            else {
                continue;
            };

            let Ok(device) = open(&node.device_path) else {
                continue;
            };
            match device.query_caps() {
                Ok(caps) if role.kind().accepts(&caps) => {
                    info!(?role, device = %node.device_path.display(), "Found");
                    *report.slot(role) = Some(ProbedNode {
                        device_path: node.device_path.clone(),
                        driver: node.driver.clone(),
                        card: caps.card,
                    });
                }
                _ => debug!(?role, device = %node.device_path.display(), "Rejected"),
            }
        }
        Ok(report)
    }

    pub fn probe(&self) -> io::Result<ProbeReport> {
        self.probe_with(KernelDevice::open)
    }
}

fn read_driver_name(entry: &Path) -> Option<String> {
    let text = fs::read_to_string(entry.join("name")).ok()?;
    Some(text.lines().next().unwrap_or_default().to_string())
}

/// The three nodes of the decode-convert-display chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Decoder,
    Converter,
    Display,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Decoder, Role::Converter, Role::Display];

    pub fn pattern(self) -> DriverPattern {
        match self {
            Self::Decoder => DriverPattern::new("s5p-mfc-dec"),
            Self::Converter => DriverPattern::all_of(["fimc", "m2m"]),
            Self::Display => DriverPattern::new("video0"),
        }
    }

    pub fn kind(self) -> DeviceKind {
        match self {
            Self::Decoder | Self::Converter => DeviceKind::M2m,
            Self::Display => DeviceKind::OutputOnly,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbedNode {
    pub device_path: PathBuf,
    pub driver: String,
    pub card: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub decoder: Option<ProbedNode>,
    pub converter: Option<ProbedNode>,
    pub display: Option<ProbedNode>,
}

impl ProbeReport {
    pub fn get(&self, role: Role) -> Option<&ProbedNode> {
        match role {
            Role::Decoder => self.decoder.as_ref(),
            Role::Converter => self.converter.as_ref(),
            Role::Display => self.display.as_ref(),
        }
    }

    fn slot(&mut self, role: Role) -> &mut Option<ProbedNode> {
        match role {
            Role::Decoder => &mut self.decoder,
            Role::Converter => &mut self.converter,
            Role::Display => &mut self.display,
        }
    }

    pub fn all_found(&self) -> bool {
        Role::ALL.into_iter().all(|r| self.get(r).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(bits: u32) -> Capabilities {
        Capabilities {
            capabilities: bits,
            ..Default::default()
        }
    }

    #[test]
    fn m2m_accepts_single_or_dual_queue() {
        assert!(DeviceKind::M2m.accepts(&caps(V4L2_CAP_VIDEO_M2M_MPLANE)));
        assert!(DeviceKind::M2m.accepts(&caps(
            V4L2_CAP_VIDEO_CAPTURE_MPLANE | V4L2_CAP_VIDEO_OUTPUT_MPLANE | V4L2_CAP_STREAMING
        )));
        assert!(!DeviceKind::M2m.accepts(&caps(
            V4L2_CAP_VIDEO_CAPTURE_MPLANE | V4L2_CAP_VIDEO_OUTPUT_MPLANE
        )));
        assert!(!DeviceKind::M2m.accepts(&caps(V4L2_CAP_VIDEO_OUTPUT_MPLANE | V4L2_CAP_STREAMING)));
    }

    #[test]
    fn output_only_needs_streaming() {
        assert!(DeviceKind::OutputOnly.accepts(&caps(V4L2_CAP_VIDEO_OUTPUT_MPLANE | V4L2_CAP_STREAMING)));
        assert!(!DeviceKind::OutputOnly.accepts(&caps(V4L2_CAP_VIDEO_OUTPUT_MPLANE)));
    }

    #[test]
    fn pattern_requires_every_needle() {
        let converter = DriverPattern::all_of(["fimc", "m2m"]);
        assert!(converter.matches("exynos4-fimc.0.m2m"));
        assert!(!converter.matches("exynos4-fimc.0.capture"));
        assert_eq!(converter.to_string(), "fimc+m2m");
        assert!(DriverPattern::new("s5p-mfc").matches("s5p-mfc-dec"));
    }
}
