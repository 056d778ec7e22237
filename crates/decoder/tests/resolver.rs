//! Device discovery over a fake video-class directory.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use m2m_common::{SessionError, Stage};
use m2m_decoder::resolver::{DeviceKind, DeviceResolver, DriverPattern, Role};
use m2m_decoder::stub::{Call, CallLog, StubConfig, StubDevice};
use m2m_decoder::v4l2::ffi::{V4L2_CAP_STREAMING, V4L2_CAP_VIDEO_OUTPUT_MPLANE};
use m2m_decoder::VideoDevice;
use tempfile::TempDir;

/// A class directory whose entries link into a device tree, the way sysfs
/// lays them out.
struct FakeSysfs {
    root: TempDir,
}

impl FakeSysfs {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("class")).unwrap();
        fs::create_dir_all(root.path().join("dev")).unwrap();
        Self { root }
    }

    fn add(&self, node: &str, driver: &str) -> &Self {
        let device_dir = self.root.path().join("devices/platform").join(node);
        fs::create_dir_all(&device_dir).unwrap();
        fs::write(device_dir.join("name"), format!("{driver}\n")).unwrap();
        symlink(&device_dir, self.root.path().join("class").join(node)).unwrap();
        self
    }

    fn resolver(&self) -> DeviceResolver {
        DeviceResolver::new(self.root.path().join("class"), self.root.path().join("dev"))
    }

    fn dev(&self, node: &str) -> PathBuf {
        self.root.path().join("dev").join(node)
    }
}

/// Opens stubs that share one log; nodes listed in `output_only` report a
/// display-style capability set.
fn opener<'a>(
    log: &'a CallLog,
    output_only: &'a [&'a str],
) -> impl FnMut(&Path) -> io::Result<StubDevice> + 'a {
    move |path| {
        let mut config = StubConfig::default();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if output_only.contains(&name) {
            config.caps.capabilities = V4L2_CAP_VIDEO_OUTPUT_MPLANE | V4L2_CAP_STREAMING;
        }
        Ok(StubDevice::with_log(config, log.clone()).at_path(path))
    }
}

#[test]
fn finds_the_decoder_among_other_nodes() {
    let sysfs = FakeSysfs::new();
    sysfs.add("video0", "s5p-fimd").add("video6", "s5p-mfc-dec").add("video7", "s5p-mfc-enc");

    let resolver = sysfs.resolver();
    let pattern = DriverPattern::new("s5p-mfc-dec");
    assert_eq!(resolver.find_device(&pattern).unwrap(), sysfs.dev("video6"));

    let nodes = resolver.nodes().unwrap();
    let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["video0", "video6", "video7"]);
    assert_eq!(nodes[1].driver, "s5p-mfc-dec");
}

#[test]
fn rejected_candidate_is_closed_before_the_next() {
    let sysfs = FakeSysfs::new();
    sysfs.add("video3", "s5p-mfc-dec").add("video6", "s5p-mfc-dec");
    let log = CallLog::default();

    let device = sysfs
        .resolver()
        .open_with(&DriverPattern::new("s5p-mfc"), DeviceKind::M2m, opener(&log, &["video3"]))
        .unwrap();
    assert_eq!(device.path(), sysfs.dev("video6"));

    let calls = log.calls();
    let first_close = calls.iter().position(|c| matches!(c, Call::Close { .. })).unwrap();
    let second_query = calls.iter().rposition(|c| *c == Call::QueryCaps).unwrap();
    assert!(first_close < second_query);
}

#[test]
fn no_capable_device_is_not_found_and_leaks_nothing() {
    let sysfs = FakeSysfs::new();
    sysfs.add("video3", "s5p-mfc-dec");
    let log = CallLog::default();

    let err = sysfs
        .resolver()
        .open_with(&DriverPattern::new("s5p-mfc-dec"), DeviceKind::M2m, opener(&log, &["video3"]))
        .unwrap_err();
    assert!(matches!(err, SessionError::DeviceNotFound { ref driver } if driver == "s5p-mfc-dec"));
    assert_eq!(err.stage(), Stage::Resolution);
    assert_eq!(log.count(|c| *c == Call::QueryCaps), 1);
    assert_eq!(log.count(|c| matches!(c, Call::Close { .. })), 1);
}

#[test]
fn missing_class_directory_is_not_found() {
    let resolver = DeviceResolver::new("/nonexistent/video4linux", "/nonexistent/dev");
    let log = CallLog::default();
    let err = resolver
        .open_with(&DriverPattern::new("s5p-mfc-dec"), DeviceKind::M2m, opener(&log, &[]))
        .unwrap_err();
    assert!(matches!(err, SessionError::DeviceNotFound { .. }));
    assert!(log.calls().is_empty());
}

#[test]
fn entries_without_a_name_are_skipped() {
    let sysfs = FakeSysfs::new();
    sysfs.add("video6", "s5p-mfc-dec");
    fs::create_dir(sysfs.root.path().join("class/video9")).unwrap();
    fs::write(sysfs.root.path().join("class/not-a-video"), "x").unwrap();

    let nodes = sysfs.resolver().nodes().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].device_path, sysfs.dev("video6"));
}

#[test]
fn probe_fills_every_role() {
    let sysfs = FakeSysfs::new();
    sysfs
        .add("video0", "video0")
        .add("video4", "exynos4-fimc.0.m2m")
        .add("video5", "exynos4-fimc.0.capture")
        .add("video6", "s5p-mfc-dec");
    let log = CallLog::default();

    let report = sysfs.resolver().probe_with(opener(&log, &["video0"])).unwrap();
    assert!(report.all_found());
    assert_eq!(report.get(Role::Decoder).unwrap().device_path, sysfs.dev("video6"));
    assert_eq!(report.get(Role::Converter).unwrap().device_path, sysfs.dev("video4"));
    assert_eq!(report.get(Role::Display).unwrap().driver, "video0");
    // Every probed handle was closed again.
    assert_eq!(
        log.count(|c| *c == Call::QueryCaps),
        log.count(|c| matches!(c, Call::Close { .. }))
    );
}
